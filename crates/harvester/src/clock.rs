//! Time source shared by the health store, rotator and dispatcher.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Supplies the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time advanced by tokio's monotonic clock.
///
/// Anchored at construction; afterwards it moves only as fast as
/// `tokio::time::Instant`, so it follows a paused runtime clock exactly.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    anchor_utc: DateTime<Utc>,
    anchor_instant: Instant,
}

impl InstantClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(anchor_utc: DateTime<Utc>) -> Self {
        Self {
            anchor_utc,
            anchor_instant: Instant::now(),
        }
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        match chrono::Duration::from_std(elapsed) {
            Ok(delta) => self.anchor_utc + delta,
            Err(_) => self.anchor_utc,
        }
    }
}
