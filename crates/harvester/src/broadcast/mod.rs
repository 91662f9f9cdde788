//! Broadcasting of job progress for real-time streaming.
//!
//! Transports (WebSocket, SSE, ...) subscribe to the broadcaster; none are
//! provided here.

pub mod job_progress;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent, JobProgressTracker, ProgressKind};
