//! Job admission, control and the background poll loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::queue::{QueueState, QueueStatus};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::{job_repo, Database, DatabaseError};
use crate::dispatch::{JobOutcome, UrlDispatcher};
use crate::jobs::{Job, JobService, JobStatus};

const PAUSED_BY_USER: &str = "Paused by user";
const JOB_PANICKED: &str = "Job task panicked";
const MAX_WINDOW_MINS: i64 = i64::MAX / 60_000;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Cannot {action} job {job_id} in status {status}")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub failed_restart_window: chrono::Duration,
    pub failed_restart_limit: u32,
    pub max_auto_restarts: u32,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            failed_restart_window: chrono::Duration::minutes(
                i64::try_from(config.failed_restart_window_mins)
                    .unwrap_or(i64::MAX)
                    .min(MAX_WINDOW_MINS),
            ),
            failed_restart_limit: config.failed_restart_limit,
            max_auto_restarts: config.max_auto_restarts,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// What one poll of the database found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub enqueued: usize,
    pub restarted: usize,
}

struct Inner {
    db: Database,
    dispatcher: Arc<UrlDispatcher>,
    jobs: JobService,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    idle: Notify,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Runs up to `max_concurrent_jobs` jobs at once, each on its own task.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        dispatcher: Arc<UrlDispatcher>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: JobService::new(db.clone(), Arc::clone(&clock)),
                db,
                dispatcher,
                settings,
                clock,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Queues a job and admits it right away when a slot is free.
    ///
    /// Queuing a job that is already queued or running is a no-op.
    pub fn enqueue(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() || job.status == JobStatus::Paused {
            return Err(invalid(&job, "enqueue"));
        }
        if self.state().push(job_id) {
            debug!(job_id, "job queued");
        }
        self.admit();
        Ok(())
    }

    pub fn pause(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() {
            return Err(invalid(&job, "pause"));
        }

        {
            let mut state = self.state();
            state.mark_paused(job_id);
            if let Some(control) = state.control(job_id) {
                control.pause(PAUSED_BY_USER);
                info!(job_id, "pause requested for running job");
                return Ok(());
            }
            state.remove_queued(job_id);
        }

        job_repo::set_status(
            &self.inner.db,
            job_id,
            JobStatus::Paused,
            Some(PAUSED_BY_USER),
            self.inner.clock.now(),
        )?;
        info!(job_id, "job paused");
        self.notify_if_idle();
        Ok(())
    }

    pub fn resume(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() {
            return Err(invalid(&job, "resume"));
        }

        {
            let mut state = self.state();
            state.clear_paused(job_id);
            if let Some(control) = state.control(job_id) {
                control.resume();
                state.requeue_on_finish(job_id);
                info!(job_id, "resume requested for running job");
                return Ok(());
            }
        }

        if job.status == JobStatus::Paused {
            job_repo::transition(
                &self.inner.db,
                job_id,
                JobStatus::Paused,
                JobStatus::Pending,
                self.inner.clock.now(),
            )?;
        }
        self.state().push(job_id);
        info!(job_id, "job resumed");
        self.admit();
        Ok(())
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() {
            return Err(invalid(&job, "cancel"));
        }

        {
            let mut state = self.state();
            if let Some(control) = state.control(job_id) {
                control.cancel();
                info!(job_id, "cancel requested for running job");
                return Ok(());
            }
            if state.is_queued(job_id) {
                state.mark_cancelled(job_id);
            } else {
                state.clear_paused(job_id);
            }
        }

        job_repo::set_status(
            &self.inner.db,
            job_id,
            JobStatus::Cancelled,
            None,
            self.inner.clock.now(),
        )?;
        info!(job_id, "job cancelled");
        Ok(())
    }

    pub fn status(&self) -> QueueStatus {
        self.state().status(self.inner.settings.max_concurrent_jobs)
    }

    /// Recovers interrupted jobs and starts the poll loop.
    ///
    /// Returns how many `running` jobs were moved back to `pending`.
    pub fn start(&self) -> Result<usize, SchedulerError> {
        let recovered = job_repo::recover_running(&self.inner.db, self.inner.clock.now())?;
        if recovered > 0 {
            info!(recovered, "requeued jobs interrupted by a previous run");
        }

        let mut poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            warn!("scheduler already started");
            return Ok(recovered);
        }

        let scheduler = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.settings.poll_interval;
        let span = info_span!("scheduler_poll", interval_secs = interval.as_secs());
        *poller = Some(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match scheduler.poll() {
                        Ok(report) if report != PollReport::default() => {
                            info!(enqueued = report.enqueued, restarted = report.restarted, "poll");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler poll failed"),
                    }
                }
                debug!("scheduler loop stopped");
            }
            .instrument(span),
        ));
        Ok(recovered)
    }

    /// Stops the poll loop. Jobs already running finish on their own.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// One pass of the background loop: queues stored `pending` jobs and
    /// restarts recently failed ones.
    pub fn poll(&self) -> Result<PollReport, SchedulerError> {
        let mut report = PollReport::default();

        for job in job_repo::list_by_status(&self.inner.db, JobStatus::Pending)? {
            if self.state().push(&job.id) {
                report.enqueued += 1;
            }
        }

        let now = self.inner.clock.now();
        let failed_since = now
            .checked_sub_signed(self.inner.settings.failed_restart_window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let restartable = job_repo::restartable_failed(
            &self.inner.db,
            failed_since,
            self.inner.settings.max_auto_restarts,
            self.inner.settings.failed_restart_limit,
        )?;
        for job in restartable {
            match self.inner.jobs.retry_failed_urls(&job.id) {
                Ok(reset) => {
                    job_repo::increment_auto_restarts(&self.inner.db, &job.id, now)?;
                    info!(
                        job_id = %job.id,
                        reset,
                        attempt = job.auto_restarts + 1,
                        "restarting failed job"
                    );
                    if self.state().push(&job.id) {
                        report.restarted += 1;
                    }
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "could not restart failed job"),
            }
        }

        self.admit();
        Ok(report)
    }

    fn admit(&self) {
        // Slots released while the runtime shuts down must not start new work.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let admission = self.state().admit(self.inner.settings.max_concurrent_jobs);

        for job_id in admission.discarded {
            debug!(job_id, "dropping cancelled job from queue");
        }
        for (job_id, control) in admission.started {
            let slot = Slot {
                scheduler: self.clone(),
                job_id: job_id.clone(),
            };
            let dispatcher = Arc::clone(&self.inner.dispatcher);
            let span = info_span!("job_task", job_id = %job_id);
            let work = runtime.spawn(
                async move { dispatcher.process_job(&job_id, &control).await }
                    .instrument(span.clone()),
            );
            // The supervising task owns the slot and settles the row if the job panics.
            runtime.spawn(
                async move {
                    match work.await {
                        Ok(Ok(JobOutcome::Paused { reason })) => info!(%reason, "job paused"),
                        Ok(Ok(outcome)) => info!(?outcome, "job finished"),
                        Ok(Err(e)) => {
                            error!(error = %e, "job failed");
                            slot.scheduler.mark_failed(&slot.job_id, &e.to_string());
                        }
                        Err(e) if e.is_panic() => {
                            error!("job task panicked");
                            slot.scheduler.mark_failed(&slot.job_id, JOB_PANICKED);
                        }
                        Err(_) => debug!("job task cancelled"),
                    }
                }
                .instrument(span),
            );
        }
        self.notify_if_idle();
    }

    fn mark_failed(&self, job_id: &str, message: &str) {
        if let Err(e) = job_repo::set_status(
            &self.inner.db,
            job_id,
            JobStatus::Failed,
            Some(message),
            self.inner.clock.now(),
        ) {
            error!(job_id, error = %e, "could not mark job failed");
        }
    }

    fn release(&self, job_id: &str) {
        let requeue = self.state().finish(job_id);
        if requeue {
            match job_repo::transition(
                &self.inner.db,
                job_id,
                JobStatus::Paused,
                JobStatus::Pending,
                self.inner.clock.now(),
            ) {
                Ok(true) => {
                    self.state().push(job_id);
                }
                Ok(false) => {}
                Err(e) => error!(job_id, error = %e, "could not requeue resumed job"),
            }
        }
        self.admit();
    }

    fn load(&self, job_id: &str) -> Result<Job, SchedulerError> {
        job_repo::find_by_id(&self.inner.db, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_if_idle(&self) {
        if self.state().is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Frees a concurrency slot when the job task ends or is dropped.
struct Slot {
    scheduler: Scheduler,
    job_id: String,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.scheduler.release(&self.job_id);
    }
}

fn invalid(job: &Job, action: &'static str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        job_id: job.id.clone(),
        status: job.status,
        action,
    }
}
