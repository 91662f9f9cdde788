//! Job queue and concurrency control.

pub mod queue;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use queue::QueueStatus;
pub use scheduler::{PollReport, Scheduler, SchedulerError, SchedulerSettings};
