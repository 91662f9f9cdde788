//! Per-job pause and cancel signalling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Requested run state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused(String),
}

/// Why a wait ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Paused(String),
}

/// Control handle shared by the scheduler and the task running one job.
///
/// The dispatcher only looks at it at URL boundaries and while waiting, so a
/// URL already in flight always reaches a disposition.
#[derive(Debug, Clone)]
pub struct JobControl {
    cancel: CancellationToken,
    state: Arc<watch::Sender<RunState>>,
}

impl JobControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            cancel: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self, reason: &str) {
        self.state.send_replace(RunState::Paused(reason.to_string()));
    }

    pub fn resume(&self) {
        self.state.send_replace(RunState::Running);
    }

    pub fn pause_reason(&self) -> Option<String> {
        match &*self.state.borrow() {
            RunState::Paused(reason) => Some(reason.clone()),
            RunState::Running => None,
        }
    }

    /// The pending interrupt, cancellation first.
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else {
            self.pause_reason().map(Interrupt::Paused)
        }
    }

    /// Sleeps for `duration` unless the job is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Sleeps for `duration` unless the job is cancelled or paused first.
    pub async fn wait(&self, duration: Duration) -> Result<(), Interrupt> {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            paused = state.wait_for(|s| matches!(s, RunState::Paused(_))) => {
                let reason = paused.ok().and_then(|s| match &*s {
                    RunState::Paused(reason) => Some(reason.clone()),
                    RunState::Running => None,
                });
                reason.map_or(Ok(()), |r| Err(Interrupt::Paused(r)))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}
