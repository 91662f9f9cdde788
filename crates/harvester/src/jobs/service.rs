//! Job creation and job-level retry.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use super::{Job, JobKind, JobStatus, JobUrl};
use crate::accounts::RotationPolicy;
use crate::clock::Clock;
use crate::db::{job_repo, job_url_repo, Database, DatabaseError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("A {0} job needs at least one URL")]
    EmptyUrlList(JobKind),

    #[error("A search job needs a search query")]
    MissingSearchQuery,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is running; pause or wait for it before retrying")]
    Running(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub name: String,
    pub kind: JobKind,
    pub urls: Vec<String>,
    pub search_query: Option<String>,
    pub max_results: Option<u32>,
    pub rotation_policy: RotationPolicy,
    pub selected_accounts: Vec<String>,
}

impl NewJob {
    pub fn new(user_id: &str, name: &str, kind: JobKind) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: name.to_string(),
            kind,
            urls: Vec::new(),
            search_query: None,
            max_results: None,
            rotation_policy: RotationPolicy::default(),
            selected_accounts: Vec::new(),
        }
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_search(mut self, query: &str, max_results: Option<u32>) -> Self {
        self.search_query = Some(query.to_string());
        self.max_results = max_results;
        self
    }

    pub fn with_rotation(mut self, policy: RotationPolicy, selected_accounts: Vec<String>) -> Self {
        self.rotation_policy = policy;
        self.selected_accounts = selected_accounts;
        self
    }
}

pub struct JobService {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl JobService {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Validates and stores a pending job together with its URLs.
    ///
    /// Blank URL entries are dropped. Search jobs may start without URLs;
    /// the dispatcher expands the query on first run.
    pub fn create(&self, request: NewJob) -> Result<Job, JobError> {
        let urls: Vec<String> = request
            .urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        let search_query = request
            .search_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);

        match request.kind {
            JobKind::Search if search_query.is_none() => return Err(JobError::MissingSearchQuery),
            JobKind::Profile | JobKind::Company if urls.is_empty() => {
                return Err(JobError::EmptyUrlList(request.kind))
            }
            _ => {}
        }

        let now = self.clock.now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            name: request.name,
            kind: request.kind,
            status: JobStatus::Pending,
            rotation_policy: request.rotation_policy,
            selected_accounts: request.selected_accounts,
            search_query,
            max_results: request.max_results,
            total_urls: urls.len() as u32,
            processed_urls: 0,
            successful_urls: 0,
            failed_urls: 0,
            auto_restarts: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            updated_at: now,
        };

        self.db.transaction(|tx| {
            job_repo::insert_in(tx, &job)?;
            for (position, url) in urls.iter().enumerate() {
                let row = job_url_repo::new_url(&job.id, position as u32, url, now);
                job_url_repo::insert_in(tx, &row)?;
            }
            Ok(())
        })?;

        log::info!(
            "Created {} job {} with {} URL(s)",
            job.kind,
            job.id,
            job.total_urls
        );
        Ok(job)
    }

    pub fn find(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        Ok(job_repo::find_by_id(&self.db, job_id)?)
    }

    pub fn urls(&self, job_id: &str) -> Result<Vec<JobUrl>, JobError> {
        Ok(job_url_repo::list_by_job(&self.db, job_id)?)
    }

    /// Puts every failed URL of a job back to pending and the job back into
    /// `pending`. Returns how many URLs were reset.
    pub fn retry_failed_urls(&self, job_id: &str) -> Result<u32, JobError> {
        let now = self.clock.now();
        let reset = self.db.transaction(|tx| {
            let job = job_repo::find_in(tx, job_id)?;
            match job {
                None => Ok(Err(JobError::JobNotFound(job_id.to_string()))),
                Some(job) if job.status == JobStatus::Running => {
                    Ok(Err(JobError::Running(job_id.to_string())))
                }
                Some(_) => job_url_repo::reset_failed_in(tx, job_id, now).map(Ok),
            }
        })??;

        log::info!("Reset {} failed URL(s) of job {}", reset, job_id);
        Ok(reset)
    }
}
