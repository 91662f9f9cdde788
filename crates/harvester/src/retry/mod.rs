//! Failure classification, retry decisions and request pacing.

pub mod classify;
pub mod policy;
pub mod throttle;

pub use classify::{classify, FailureKind};
pub use policy::{RetryDecision, RetryPolicy};
pub use throttle::Throttle;
