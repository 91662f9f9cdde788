//! Drives the URLs of one job through the scraper.
//!
//! URLs run strictly one after another in creation order. Each attempt gets
//! an account from the rotator, and every outcome is folded into account
//! health before the retry policy decides what happens next.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use super::control::{Interrupt, JobControl};
use crate::accounts::{
    Account, AccountCredentials, AccountHealthStore, AccountLeases, AccountRotator,
    CredentialError, CredentialStore, RotationError, SelectionRequest,
};
use crate::broadcast::{JobProgressBroadcaster, JobProgressTracker};
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::db::{assignment_repo, job_repo, job_url_repo, Database, DatabaseError};
use crate::jobs::{Job, JobKind, JobStatus, JobUrl};
use crate::results::{ResultSink, SaveTarget, SinkError};
use crate::retry::{classify, RetryDecision, RetryPolicy, Throttle};
use crate::sanitize::{parse_target_url, redact_url};
use crate::scraper::{ScrapeFailure, ScrapeKind, ScrapeSuccess, Scraper};

/// Result count used when a search job does not set one.
pub const DEFAULT_SEARCH_RESULTS: u32 = 100;

const MIN_ELIGIBILITY_WAIT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Rotation(#[from] RotationError),
}

/// How a call to [`UrlDispatcher::process_job`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every URL is terminal and at least one succeeded, or there were none.
    Completed,
    /// Every URL is terminal and none succeeded.
    Failed,
    /// The job stopped at a URL boundary and is persisted as `paused`.
    Paused { reason: String },
    Cancelled,
    /// The job was already finished when the run started.
    AlreadyTerminal(JobStatus),
}

/// Job-level pacing and patience.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub request_delay: Duration,
    /// Consecutive failed URLs after which the job pauses; 0 disables.
    pub max_consecutive_failures: u32,
    pub max_eligibility_wait: Duration,
    pub max_eligibility_waits: u32,
    pub failure_rate_window: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            request_delay: Duration::from_millis(config.request_delay_ms),
            max_consecutive_failures: config.max_consecutive_failures,
            max_eligibility_wait: Duration::from_secs(config.max_eligibility_wait_secs),
            max_eligibility_waits: config.max_eligibility_waits,
            failure_rate_window: config.failure_rate_window,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// One unit of scraper work that may be retried across accounts.
#[async_trait]
trait Work: Send + Sync {
    type Output: Send;

    /// The URL row whose attempt counter this work advances.
    fn job_url_id(&self) -> Option<&str>;

    async fn perform(
        &self,
        scraper: &dyn Scraper,
        credentials: &AccountCredentials,
    ) -> Result<Self::Output, ScrapeFailure>;
}

struct ScrapeWork<'a> {
    url: &'a JobUrl,
    kind: ScrapeKind,
}

#[async_trait]
impl<'a> Work for ScrapeWork<'a> {
    type Output = ScrapeSuccess;

    fn job_url_id(&self) -> Option<&str> {
        Some(&self.url.id)
    }

    async fn perform(
        &self,
        scraper: &dyn Scraper,
        credentials: &AccountCredentials,
    ) -> Result<ScrapeSuccess, ScrapeFailure> {
        scraper.scrape(&self.url.url, credentials, self.kind).await
    }
}

struct SearchWork<'a> {
    query: &'a str,
    max_results: u32,
}

#[async_trait]
impl<'a> Work for SearchWork<'a> {
    type Output = Vec<String>;

    fn job_url_id(&self) -> Option<&str> {
        None
    }

    async fn perform(
        &self,
        scraper: &dyn Scraper,
        credentials: &AccountCredentials,
    ) -> Result<Vec<String>, ScrapeFailure> {
        scraper.search(self.query, self.max_results, credentials).await
    }
}

enum Attempted<T> {
    Succeeded { output: T, account_id: String },
    Abandoned { error: String, account_id: String },
    Interrupted(Interrupt),
}

enum SearchStop {
    Abandoned(String),
    Interrupted(Interrupt),
}

enum UrlDisposition {
    Completed(Job),
    Failed { job: Job, error: String },
    Interrupted(Interrupt),
}

/// Processes jobs URL by URL.
pub struct UrlDispatcher {
    db: Database,
    rotator: Arc<AccountRotator>,
    health: Arc<AccountHealthStore>,
    credentials: Arc<dyn CredentialStore>,
    scraper: Arc<dyn Scraper>,
    sink: ResultSink,
    retry: RetryPolicy,
    leases: AccountLeases,
    progress: JobProgressBroadcaster,
    settings: DispatchSettings,
    clock: Arc<dyn Clock>,
}

impl UrlDispatcher {
    pub fn new(
        db: Database,
        rotator: Arc<AccountRotator>,
        credentials: Arc<dyn CredentialStore>,
        scraper: Arc<dyn Scraper>,
        progress: JobProgressBroadcaster,
        retry: RetryPolicy,
        settings: DispatchSettings,
    ) -> Self {
        let health = Arc::clone(rotator.health());
        let clock = Arc::clone(health.clock());
        Self {
            sink: ResultSink::new(db.clone(), Arc::clone(&clock)),
            db,
            rotator,
            health,
            credentials,
            scraper,
            retry,
            leases: AccountLeases::new(),
            progress,
            settings,
            clock,
        }
    }

    pub fn leases(&self) -> &AccountLeases {
        &self.leases
    }

    /// Runs a job until its URLs are all terminal or it is paused or
    /// cancelled. The outcome is persisted before this returns.
    pub async fn process_job(
        &self,
        job_id: &str,
        control: &JobControl,
    ) -> Result<JobOutcome, DispatchError> {
        let job = job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            debug!(job_id, status = %job.status, "job already finished");
            return Ok(JobOutcome::AlreadyTerminal(job.status));
        }

        let span = info_span!(
            "process_job",
            job_id = %job.id,
            kind = %job.kind,
            user_id = %job.user_id
        );
        self.run(job, control).instrument(span).await
    }

    async fn run(&self, job: Job, control: &JobControl) -> Result<JobOutcome, DispatchError> {
        let tracker = self.progress.track(&job.id);
        if let Some(interrupt) = control.interrupt() {
            return self.stop(&job.id, &tracker, interrupt);
        }

        let mut job = job_repo::mark_running(&self.db, &job.id, self.clock.now())?
            .ok_or_else(|| DispatchError::JobNotFound(job.id.clone()))?;
        info!(
            total = job.total_urls,
            processed = job.processed_urls,
            "job started"
        );
        let request = SelectionRequest::for_job(&job);

        if job.kind == JobKind::Search && job_url_repo::count_by_job(&self.db, &job.id)? == 0 {
            match self.expand_search(&job, &request, control).await? {
                Ok(found) => {
                    job = self.reload(&job.id)?;
                    info!(found, "search expanded");
                }
                Err(SearchStop::Interrupted(interrupt)) => {
                    return self.stop(&job.id, &tracker, interrupt)
                }
                Err(SearchStop::Abandoned(error)) => {
                    let message = format!("Search failed: {}", error);
                    job_repo::set_status(
                        &self.db,
                        &job.id,
                        JobStatus::Failed,
                        Some(&message),
                        self.clock.now(),
                    )?;
                    let job = self.reload(&job.id)?;
                    warn!(error = %message, "job failed");
                    tracker.finished(&job);
                    return Ok(JobOutcome::Failed);
                }
            }
        }
        tracker.started(&job);

        let urls: Vec<JobUrl> = job_url_repo::list_by_job(&self.db, &job.id)?
            .into_iter()
            .filter(|u| !u.status.is_terminal())
            .collect();
        self.assign_accounts(&job, &request, urls.len() as u32)?;

        let mut throttle = Throttle::new(
            self.settings.request_delay,
            self.settings.failure_rate_window,
        );
        let mut consecutive_failed = 0u32;
        for (index, url) in urls.iter().enumerate() {
            if let Some(interrupt) = control.interrupt() {
                return self.stop(&job.id, &tracker, interrupt);
            }

            let span = info_span!(
                "process_url",
                url = %redact_url(&url.url),
                position = url.position
            );
            match self.process_url(&job, &request, url, control).instrument(span).await? {
                UrlDisposition::Completed(updated) => {
                    throttle.record(true);
                    consecutive_failed = 0;
                    tracker.url_completed(&updated, &url.url);
                }
                UrlDisposition::Failed { job: updated, error } => {
                    throttle.record(false);
                    consecutive_failed += 1;
                    tracker.url_failed(&updated, &url.url, &error);

                    let remaining = index + 1 < urls.len();
                    let threshold = self.settings.max_consecutive_failures;
                    if remaining && threshold > 0 && consecutive_failed >= threshold {
                        let reason = format!(
                            "Paused after {} consecutive failed URLs (last error: {}). Check the accounts, then resume.",
                            consecutive_failed, error
                        );
                        return self.stop(&job.id, &tracker, Interrupt::Paused(reason));
                    }
                }
                UrlDisposition::Interrupted(interrupt) => {
                    return self.stop(&job.id, &tracker, interrupt);
                }
            }

            if index + 1 < urls.len() {
                let delay = throttle.delay();
                if !delay.is_zero() {
                    debug!(
                        delay_ms = delay.as_millis() as u64,
                        failure_rate = throttle.failure_rate(),
                        "pausing between requests"
                    );
                    if let Err(interrupt) = control.sleep(delay).await {
                        return self.stop(&job.id, &tracker, interrupt);
                    }
                }
            }
        }

        self.finish(&job.id, &tracker)
    }

    async fn expand_search(
        &self,
        job: &Job,
        request: &SelectionRequest,
        control: &JobControl,
    ) -> Result<Result<u32, SearchStop>, DispatchError> {
        let Some(query) = job.search_query.as_deref() else {
            return Ok(Err(SearchStop::Abandoned(
                "search job has no query".to_string(),
            )));
        };
        let max_results = job.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS);
        let work = SearchWork { query, max_results };

        match self.attempt(request, &work, 0, control).await? {
            Attempted::Succeeded { output, .. } => {
                let mut seen = HashSet::new();
                let urls: Vec<String> = output
                    .into_iter()
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty() && seen.insert(u.clone()))
                    .take(max_results as usize)
                    .collect();
                let inserted = job_url_repo::append(&self.db, &job.id, &urls, self.clock.now())?;
                Ok(Ok(inserted.len() as u32))
            }
            Attempted::Abandoned { error, .. } => Ok(Err(SearchStop::Abandoned(error))),
            Attempted::Interrupted(interrupt) => Ok(Err(SearchStop::Interrupted(interrupt))),
        }
    }

    /// Spreads the remaining URLs evenly over the accounts currently
    /// selectable for the job.
    fn assign_accounts(
        &self,
        job: &Job,
        request: &SelectionRequest,
        remaining: u32,
    ) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let pool = self
            .health
            .selectable_accounts(&job.user_id, &request.manual_ids, now)?;
        if pool.is_empty() || remaining == 0 {
            return Ok(());
        }
        let count = pool.len() as u32;
        let (base, extra) = (remaining / count, remaining % count);
        for (i, account) in pool.iter().enumerate() {
            let assigned = base + u32::from((i as u32) < extra);
            assignment_repo::assign(&self.db, &job.id, &account.id, assigned, now)?;
        }
        debug!(accounts = count, remaining, "URLs assigned");
        Ok(())
    }

    async fn process_url(
        &self,
        job: &Job,
        request: &SelectionRequest,
        url: &JobUrl,
        control: &JobControl,
    ) -> Result<UrlDisposition, DispatchError> {
        if parse_target_url(&url.url).is_none() {
            let error = format!("Invalid URL: {}", url.url);
            warn!(error = %error, "URL rejected");
            let job = self.fail_url(&job.id, &url.id, &error, None)?;
            return Ok(UrlDisposition::Failed { job, error });
        }

        let work = ScrapeWork {
            url,
            kind: job.kind.scrape_kind(),
        };
        match self.attempt(request, &work, url.attempts, control).await? {
            Attempted::Succeeded { output, account_id } => {
                let target = SaveTarget::new(&job.id, &url.url).for_url(&url.id);
                match self
                    .sink
                    .save(&output.record, output.raw_payload.as_deref(), &target)
                {
                    Ok(result_id) => {
                        let now = self.clock.now();
                        let settled = job_url_repo::complete(&self.db, &url.id, &result_id, now)?;
                        assignment_repo::record_processed(
                            &self.db,
                            &job.id,
                            &account_id,
                            true,
                            now,
                        )?;
                        debug!(result_id = %result_id, account_id = %account_id, "URL completed");
                        Ok(UrlDisposition::Completed(self.settled(&job.id, settled)?))
                    }
                    Err(SinkError::Validation(reason)) => {
                        let error = format!("Result rejected: {}", reason);
                        warn!(error = %error, "URL failed");
                        let job = self.fail_url(&job.id, &url.id, &error, Some(&account_id))?;
                        Ok(UrlDisposition::Failed { job, error })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Attempted::Abandoned { error, account_id } => {
                warn!(error = %error, account_id = %account_id, "URL failed");
                let job = self.fail_url(&job.id, &url.id, &error, Some(&account_id))?;
                Ok(UrlDisposition::Failed { job, error })
            }
            Attempted::Interrupted(interrupt) => Ok(UrlDisposition::Interrupted(interrupt)),
        }
    }

    /// Runs `work` until it succeeds, is abandoned by the retry policy, or
    /// the job is interrupted while waiting.
    async fn attempt<W: Work>(
        &self,
        request: &SelectionRequest,
        work: &W,
        prior_attempts: u32,
        control: &JobControl,
    ) -> Result<Attempted<W::Output>, DispatchError> {
        let mut request = request.clone();
        let mut attempt = prior_attempts;
        let mut current: Option<Account> = None;
        let mut waits = 0u32;

        loop {
            let account = match self
                .obtain_account(&request, current.take(), &mut waits, control)
                .await?
            {
                Ok(account) => account,
                Err(interrupt) => return Ok(Attempted::Interrupted(interrupt)),
            };

            // Held from the eligibility re-check until the outcome is recorded.
            let lease = self.leases.acquire(&account.id).await;
            let account = match self.health.find(&account.id)? {
                Some(fresh) if fresh.is_usable(self.clock.now()) => fresh,
                _ => {
                    drop(lease);
                    debug!(
                        account_id = %account.id,
                        "account became ineligible while leased, rotating"
                    );
                    continue;
                }
            };

            attempt = match work.job_url_id() {
                Some(id) => job_url_repo::begin_attempt(&self.db, id, self.clock.now())?,
                None => attempt + 1,
            };

            let result = match self.credentials.credentials(&account.id).await {
                Ok(credentials) => work.perform(self.scraper.as_ref(), &credentials).await,
                Err(CredentialError::Database(e)) => return Err(e.into()),
                Err(e) => Err(ScrapeFailure::new(format!("invalid cookies: {}", e))),
            };

            let failure = match result {
                Ok(output) => {
                    self.health.record_success(&account.id)?;
                    drop(lease);
                    return Ok(Attempted::Succeeded {
                        output,
                        account_id: account.id,
                    });
                }
                Err(failure) => failure,
            };

            let kind = classify(&failure);
            let message = failure.to_string();
            self.health.record_failure(&account.id, kind, &message)?;
            drop(lease);
            if let Some(id) = work.job_url_id() {
                job_url_repo::note_error(&self.db, id, &message, self.clock.now())?;
            }
            let has_alternate = kind.is_account_attributable()
                && self.rotator.has_alternate(&request, &account.id).await?;
            let decision = self.retry.decide(attempt, kind, has_alternate);
            warn!(
                account_id = %account.id,
                attempt,
                failure_kind = %kind,
                decision = ?decision,
                error = %message,
                "attempt failed"
            );

            match decision {
                RetryDecision::RetrySame => current = Some(account),
                RetryDecision::RetryBackoff(delay) => {
                    if let Err(interrupt) = control.sleep(delay).await {
                        return Ok(Attempted::Interrupted(interrupt));
                    }
                    current = Some(account);
                }
                RetryDecision::RetryNewAccount => {
                    request.avoid_account_id = Some(account.id);
                }
                RetryDecision::Abandon => {
                    return Ok(Attempted::Abandoned {
                        error: message,
                        account_id: account.id,
                    })
                }
            }
        }
    }

    /// Keeps `current` while it is still eligible, otherwise asks the
    /// rotator, waiting out empty pools up to the configured number of
    /// times.
    async fn obtain_account(
        &self,
        request: &SelectionRequest,
        current: Option<Account>,
        waits: &mut u32,
        control: &JobControl,
    ) -> Result<Result<Account, Interrupt>, DispatchError> {
        if let Some(account) = current {
            match self.health.find(&account.id)? {
                Some(fresh) if fresh.is_eligible(self.clock.now()) => return Ok(Ok(fresh)),
                _ => debug!(account_id = %account.id, "account no longer eligible, rotating"),
            }
        }

        loop {
            let earliest = match self.rotator.next(request).await {
                Ok(account) => return Ok(Ok(account)),
                Err(RotationError::NoEligibleAccounts {
                    earliest_eligible_at,
                    ..
                }) => earliest_eligible_at,
                Err(e) => return Err(e.into()),
            };

            if *waits >= self.settings.max_eligibility_waits {
                let reason = match earliest {
                    Some(at) => format!(
                        "No eligible accounts after {} wait(s); the next account recovers at {}. Add or refresh accounts, then resume.",
                        waits,
                        at.to_rfc3339()
                    ),
                    None => format!(
                        "No eligible accounts after {} wait(s) and none recovers on its own. Add or refresh accounts, then resume.",
                        waits
                    ),
                };
                warn!(reason = %reason, "account pool exhausted");
                return Ok(Err(Interrupt::Paused(reason)));
            }
            *waits += 1;

            let cap = self.settings.max_eligibility_wait;
            let wait = earliest
                .and_then(|at| (at - self.clock.now()).to_std().ok())
                .unwrap_or(cap)
                .min(cap)
                .max(MIN_ELIGIBILITY_WAIT);
            info!(
                wait_secs = wait.as_secs(),
                wait_number = *waits,
                "no eligible accounts, waiting"
            );
            if let Err(interrupt) = control.wait(wait).await {
                return Ok(Err(interrupt));
            }
        }
    }

    fn fail_url(
        &self,
        job_id: &str,
        url_id: &str,
        error: &str,
        account_id: Option<&str>,
    ) -> Result<Job, DispatchError> {
        let now = self.clock.now();
        let settled = job_url_repo::fail(&self.db, url_id, error, now)?;
        if let Some(account_id) = account_id {
            assignment_repo::record_processed(&self.db, job_id, account_id, false, now)?;
        }
        self.settled(job_id, settled)
    }

    fn settled(&self, job_id: &str, job: Option<Job>) -> Result<Job, DispatchError> {
        match job {
            Some(job) => Ok(job),
            None => self.reload(job_id),
        }
    }

    fn reload(&self, job_id: &str) -> Result<Job, DispatchError> {
        job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))
    }

    /// Persists a pause or cancellation observed at a boundary.
    fn stop(
        &self,
        job_id: &str,
        tracker: &JobProgressTracker,
        interrupt: Interrupt,
    ) -> Result<JobOutcome, DispatchError> {
        let now = self.clock.now();
        match interrupt {
            Interrupt::Cancelled => {
                job_repo::set_status(&self.db, job_id, JobStatus::Cancelled, None, now)?;
                assignment_repo::complete_for_job(&self.db, job_id, now)?;
                let job = self.reload(job_id)?;
                info!(processed = job.processed_urls, "job cancelled");
                tracker.finished(&job);
                Ok(JobOutcome::Cancelled)
            }
            Interrupt::Paused(reason) => {
                job_repo::set_status(&self.db, job_id, JobStatus::Paused, Some(&reason), now)?;
                let job = self.reload(job_id)?;
                info!(reason = %reason, processed = job.processed_urls, "job paused");
                tracker.paused(&job, &reason);
                Ok(JobOutcome::Paused { reason })
            }
        }
    }

    fn finish(
        &self,
        job_id: &str,
        tracker: &JobProgressTracker,
    ) -> Result<JobOutcome, DispatchError> {
        let job = self.reload(job_id)?;
        let (status, message) = if job.failed_urls == 0 {
            (JobStatus::Completed, None)
        } else if job.successful_urls > 0 {
            (
                JobStatus::Completed,
                Some(format!(
                    "{} of {} URL(s) failed",
                    job.failed_urls, job.total_urls
                )),
            )
        } else {
            let last_error = job_url_repo::list_by_job(&self.db, job_id)?
                .into_iter()
                .rev()
                .find_map(|u| u.error_message);
            let mut message = format!("All {} URL(s) failed", job.failed_urls);
            if let Some(error) = last_error {
                message.push_str(&format!("; last error: {}", error));
            }
            (JobStatus::Failed, Some(message))
        };

        let now = self.clock.now();
        job_repo::set_status(&self.db, job_id, status, message.as_deref(), now)?;
        assignment_repo::complete_for_job(&self.db, job_id, now)?;
        let job = self.reload(job_id)?;
        info!(
            status = %job.status,
            successful = job.successful_urls,
            failed = job.failed_urls,
            "job finished"
        );
        tracker.finished(&job);
        Ok(if status == JobStatus::Completed {
            JobOutcome::Completed
        } else {
            JobOutcome::Failed
        })
    }
}
