//! Inter-request delay that stretches as a job's recent failure rate grows.

use std::collections::VecDeque;
use std::time::Duration;

/// Rolling window over the most recent URL outcomes of one job.
#[derive(Debug, Clone)]
pub struct Throttle {
    base_delay: Duration,
    window: usize,
    outcomes: VecDeque<bool>,
}

impl Throttle {
    pub fn new(base_delay: Duration, window: usize) -> Self {
        let window = window.max(1);
        Self {
            base_delay,
            window,
            outcomes: VecDeque::with_capacity(window),
        }
    }

    /// Records one URL outcome, evicting the oldest beyond the window.
    pub fn record(&mut self, succeeded: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(succeeded);
    }

    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failed = self.outcomes.iter().filter(|ok| !**ok).count();
        failed as f64 / self.outcomes.len() as f64
    }

    /// Delay to apply before the next URL.
    pub fn delay(&self) -> Duration {
        let rate = self.failure_rate();
        let factor = if rate > 0.5 {
            3.0
        } else if rate > 0.3 {
            2.0
        } else if rate > 0.1 {
            1.5
        } else {
            1.0
        };
        self.base_delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle_with(successes: usize, failures: usize) -> Throttle {
        let mut t = Throttle::new(Duration::from_secs(2), 10);
        for _ in 0..successes {
            t.record(true);
        }
        for _ in 0..failures {
            t.record(false);
        }
        t
    }

    #[test]
    fn test_delay_tiers() {
        assert_eq!(throttle_with(0, 0).delay(), Duration::from_secs(2));
        assert_eq!(throttle_with(9, 1).delay(), Duration::from_secs(2));
        assert_eq!(throttle_with(8, 2).delay(), Duration::from_secs(3));
        assert_eq!(throttle_with(6, 4).delay(), Duration::from_secs(4));
        assert_eq!(throttle_with(4, 6).delay(), Duration::from_secs(6));
    }

    #[test]
    fn test_window_forgets_old_outcomes() {
        let mut t = throttle_with(0, 10);
        for _ in 0..10 {
            t.record(true);
        }
        assert_eq!(t.failure_rate(), 0.0);
    }
}
