//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::{Job, JobStatus};

/// What happened to the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Started,
    UrlCompleted,
    UrlFailed,
    Paused,
    Finished,
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressKind::Started => write!(f, "Started"),
            ProgressKind::UrlCompleted => write!(f, "URL completed"),
            ProgressKind::UrlFailed => write!(f, "URL failed"),
            ProgressKind::Paused => write!(f, "Paused"),
            ProgressKind::Finished => write!(f, "Finished"),
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub kind: ProgressKind,
    /// Job status after the event.
    pub status: JobStatus,
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub total: u32,
    pub message: String,
    /// URL the event is about, for per-URL events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    /// Creates an event carrying the job's current counters.
    pub fn new(job: &Job, kind: ProgressKind, message: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            kind,
            status: job.status,
            processed: job.processed_urls,
            successful: job.successful_urls,
            failed: job.failed_urls,
            total: job.total_urls,
            message: message.to_string(),
            url: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one job run.
    pub fn track(&self, job_id: &str) -> JobProgressTracker {
        JobProgressTracker::new(job_id, Arc::clone(&self.sender))
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Publishes the progress of a single job.
pub struct JobProgressTracker {
    job_id: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    pub fn new(job_id: &str, sender: Arc<broadcast::Sender<JobProgressEvent>>) -> Self {
        Self {
            job_id: job_id.to_string(),
            sender,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn send(&self, event: JobProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn started(&self, job: &Job) {
        let message = format!("Processing {} URL(s)", job.total_urls);
        self.send(JobProgressEvent::new(job, ProgressKind::Started, &message));
    }

    pub fn url_completed(&self, job: &Job, url: &str) {
        let message = format!("{}/{} processed", job.processed_urls, job.total_urls);
        self.send(JobProgressEvent::new(job, ProgressKind::UrlCompleted, &message).with_url(url));
    }

    pub fn url_failed(&self, job: &Job, url: &str, error: &str) {
        let message = format!("{}/{} processed", job.processed_urls, job.total_urls);
        self.send(
            JobProgressEvent::new(job, ProgressKind::UrlFailed, &message)
                .with_url(url)
                .with_error(error),
        );
    }

    pub fn paused(&self, job: &Job, reason: &str) {
        self.send(JobProgressEvent::new(job, ProgressKind::Paused, reason));
    }

    pub fn finished(&self, job: &Job) {
        let message = match job.status {
            JobStatus::Completed if job.failed_urls == 0 => "Job completed".to_string(),
            JobStatus::Completed => format!("Job completed with {} failed URL(s)", job.failed_urls),
            JobStatus::Cancelled => "Job cancelled".to_string(),
            _ => "Job failed".to_string(),
        };
        let mut event = JobProgressEvent::new(job, ProgressKind::Finished, &message);
        event.error = job.error_message.clone();
        self.send(event);
    }
}
