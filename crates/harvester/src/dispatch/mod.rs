//! Per-job URL processing.

pub mod control;
pub mod dispatcher;

pub use control::{Interrupt, JobControl, RunState};
pub use dispatcher::{
    DispatchError, DispatchSettings, JobOutcome, UrlDispatcher, DEFAULT_SEARCH_RESULTS,
};
