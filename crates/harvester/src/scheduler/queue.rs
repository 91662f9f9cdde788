//! In-memory queue bookkeeping.
//!
//! Not durable: the scheduler rebuilds it from stored `pending` jobs on
//! start.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::dispatch::JobControl;

/// Snapshot of the queue for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: Vec<String>,
    pub in_flight: Vec<String>,
    pub paused: Vec<String>,
    pub cancelled: Vec<String>,
    pub max_concurrent_jobs: usize,
}

/// Jobs admitted and discarded by one admission pass.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    pub started: Vec<(String, JobControl)>,
    pub discarded: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    queue: VecDeque<String>,
    in_flight: HashMap<String, JobControl>,
    paused: HashSet<String>,
    cancelled: HashSet<String>,
    /// In-flight jobs resumed after their pause may already have been seen.
    requeue_on_finish: HashSet<String>,
}

impl QueueState {
    pub fn is_queued(&self, job_id: &str) -> bool {
        self.queue.iter().any(|id| id == job_id)
    }

    pub fn is_known(&self, job_id: &str) -> bool {
        self.in_flight.contains_key(job_id) || self.is_queued(job_id)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub fn control(&self, job_id: &str) -> Option<&JobControl> {
        self.in_flight.get(job_id)
    }

    /// Appends a job unless it is already queued or running.
    pub fn push(&mut self, job_id: &str) -> bool {
        if self.is_known(job_id) {
            return false;
        }
        self.paused.remove(job_id);
        self.cancelled.remove(job_id);
        self.queue.push_back(job_id.to_string());
        true
    }

    pub fn remove_queued(&mut self, job_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != job_id);
        self.queue.len() != before
    }

    pub fn mark_paused(&mut self, job_id: &str) {
        self.paused.insert(job_id.to_string());
        self.requeue_on_finish.remove(job_id);
    }

    pub fn clear_paused(&mut self, job_id: &str) -> bool {
        self.paused.remove(job_id)
    }

    pub fn mark_cancelled(&mut self, job_id: &str) {
        self.paused.remove(job_id);
        self.requeue_on_finish.remove(job_id);
        self.cancelled.insert(job_id.to_string());
    }

    pub fn requeue_on_finish(&mut self, job_id: &str) {
        self.requeue_on_finish.insert(job_id.to_string());
    }

    /// Pops queued jobs into free slots.
    ///
    /// Cancelled entries are dropped and reported; paused entries are dropped
    /// silently, since resuming queues them again.
    pub fn admit(&mut self, capacity: usize) -> Admission {
        let mut admission = Admission::default();
        while self.in_flight.len() < capacity {
            let Some(job_id) = self.queue.pop_front() else {
                break;
            };
            if self.cancelled.remove(&job_id) {
                admission.discarded.push(job_id);
                continue;
            }
            if self.paused.contains(&job_id) {
                continue;
            }
            let control = JobControl::new();
            self.in_flight.insert(job_id.clone(), control.clone());
            admission.started.push((job_id, control));
        }
        admission
    }

    /// Frees the slot of a finished job. Returns whether it asked to be
    /// queued again.
    pub fn finish(&mut self, job_id: &str) -> bool {
        self.in_flight.remove(job_id);
        self.paused.remove(job_id);
        self.cancelled.remove(job_id);
        self.requeue_on_finish.remove(job_id)
    }

    pub fn status(&self, max_concurrent_jobs: usize) -> QueueStatus {
        let mut in_flight: Vec<String> = self.in_flight.keys().cloned().collect();
        in_flight.sort();
        let mut paused: Vec<String> = self.paused.iter().cloned().collect();
        paused.sort();
        let mut cancelled: Vec<String> = self.cancelled.iter().cloned().collect();
        cancelled.sort();
        QueueStatus {
            queued: self.queue.iter().cloned().collect(),
            in_flight,
            paused,
            cancelled,
            max_concurrent_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(admission: &Admission) -> Vec<&str> {
        admission.started.iter().map(|(id, _)| id.as_str()).collect()
    }

    #[test]
    fn test_push_is_idempotent() {
        let mut state = QueueState::default();
        assert!(state.push("j1"));
        assert!(!state.push("j1"));
        state.admit(1);
        assert!(!state.push("j1"));
        assert_eq!(state.status(1).queued, Vec::<String>::new());
    }

    #[test]
    fn test_admission_respects_capacity_and_order() {
        let mut state = QueueState::default();
        for id in ["j1", "j2", "j3", "j4", "j5"] {
            state.push(id);
        }
        let first = state.admit(3);
        assert_eq!(ids(&first), vec!["j1", "j2", "j3"]);
        assert!(state.admit(3).started.is_empty());

        assert!(!state.finish("j2"));
        let next = state.admit(3);
        assert_eq!(ids(&next), vec!["j4"]);
        assert_eq!(state.status(3).queued, vec!["j5".to_string()]);
    }

    #[test]
    fn test_admission_discards_cancelled_and_skips_paused() {
        let mut state = QueueState::default();
        for id in ["j1", "j2", "j3"] {
            state.push(id);
        }
        state.mark_cancelled("j1");
        state.mark_paused("j2");
        let admission = state.admit(5);
        assert_eq!(admission.discarded, vec!["j1".to_string()]);
        assert_eq!(ids(&admission), vec!["j3"]);
        assert_eq!(state.status(5).paused, vec!["j2".to_string()]);
    }

    #[test]
    fn test_finish_reports_requeue_request() {
        let mut state = QueueState::default();
        state.push("j1");
        state.admit(1);
        state.mark_paused("j1");
        state.clear_paused("j1");
        state.requeue_on_finish("j1");
        assert!(state.finish("j1"));
        assert!(state.is_idle());
    }

    #[test]
    fn test_remove_queued() {
        let mut state = QueueState::default();
        state.push("j1");
        state.push("j2");
        assert!(state.remove_queued("j1"));
        assert!(!state.remove_queued("j1"));
        assert!(state.is_queued("j2"));
    }
}
