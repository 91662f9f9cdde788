//! Persistence of scraped records.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use super::{CompanyRecord, ProfileRecord, ScrapeRecord};
use crate::accounts::RotationPolicy;
use crate::clock::Clock;
use crate::db::result_repo::{self, NewResult};
use crate::db::{job_repo, job_url_repo, Database, DatabaseError};
use crate::jobs::{Job, JobKind, JobStatus};
use crate::sanitize::{truncate_chars, truncate_optional};
use crate::scraper::ScrapeKind;

const URL_MAX_CHARS: usize = 2_048;
const SHORT_TEXT_MAX_CHARS: usize = 255;
const HEADLINE_MAX_CHARS: usize = 500;
const LONG_TEXT_MAX_CHARS: usize = 10_000;
const RAW_PAYLOAD_MAX_CHARS: usize = 1_000_000;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid result: {0}")]
    Validation(String),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Metadata for creating the owning job when it does not exist.
#[derive(Debug, Clone)]
pub struct FallbackJob {
    pub user_id: String,
    pub name: String,
}

/// Where a record belongs.
#[derive(Debug, Clone)]
pub struct SaveTarget<'a> {
    pub job_id: &'a str,
    pub job_url_id: Option<&'a str>,
    pub source_url: &'a str,
    pub fallback: Option<FallbackJob>,
}

impl<'a> SaveTarget<'a> {
    pub fn new(job_id: &'a str, source_url: &'a str) -> Self {
        Self {
            job_id,
            job_url_id: None,
            source_url,
            fallback: None,
        }
    }

    pub fn for_url(mut self, job_url_id: &'a str) -> Self {
        self.job_url_id = Some(job_url_id);
        self
    }

    pub fn with_fallback(mut self, user_id: &str, name: &str) -> Self {
        self.fallback = Some(FallbackJob {
            user_id: user_id.to_string(),
            name: name.to_string(),
        });
        self
    }
}

/// Writes records into `profile_results` / `company_results`.
pub struct ResultSink {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ResultSink {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Stores a record and returns the new result ID.
    ///
    /// The job lookup, the optional minimal-job insert and the result insert
    /// share one transaction.
    pub fn save(
        &self,
        record: &ScrapeRecord,
        raw_payload: Option<&str>,
        target: &SaveTarget<'_>,
    ) -> Result<String, SinkError> {
        if target.source_url.trim().is_empty() {
            return Err(SinkError::Validation("source URL is empty".to_string()));
        }

        let record = truncate_record(record);
        let data = serde_json::to_string(&record)?;
        let raw_payload = raw_payload.map(|r| truncate_chars(r, RAW_PAYLOAD_MAX_CHARS));
        let source_url = truncate_chars(target.source_url.trim(), URL_MAX_CHARS);
        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();

        let outcome = self.db.transaction(|tx| {
            let mut job_url_id = target.job_url_id;
            match job_repo::find_in(tx, target.job_id)? {
                Some(job) => {
                    if job.kind.scrape_kind() != record.kind() {
                        return Ok(Err(SinkError::Validation(format!(
                            "{} record does not belong to {} job {}",
                            record.kind().as_str(),
                            job.kind,
                            job.id
                        ))));
                    }
                }
                None => {
                    let Some(ref fallback) = target.fallback else {
                        return Ok(Err(SinkError::JobNotFound(target.job_id.to_string())));
                    };
                    let job = minimal_job(target.job_id, fallback, record.kind(), now);
                    job_repo::insert_in(tx, &job)?;
                    log::info!("Created placeholder job {} for orphan result", job.id);
                    job_url_id = None;
                }
            }
            if let Some(url_id) = job_url_id {
                if !job_url_repo::exists_in(tx, url_id)? {
                    log::warn!("Result for unknown job URL {}, storing without link", url_id);
                    job_url_id = None;
                }
            }

            result_repo::insert_in(
                tx,
                &NewResult {
                    id: &id,
                    job_id: target.job_id,
                    job_url_id,
                    source_url,
                    record: &record,
                    data: &data,
                    raw_payload,
                    created_at: now,
                },
            )?;
            Ok(Ok(()))
        })?;
        outcome?;

        if !record.is_content_valid() {
            log::warn!(
                "Stored {} result {} without a name for {}",
                record.kind().as_str(),
                id,
                crate::sanitize::redact_url(source_url)
            );
        }
        Ok(id)
    }
}

fn minimal_job(
    id: &str,
    fallback: &FallbackJob,
    kind: ScrapeKind,
    now: chrono::DateTime<chrono::Utc>,
) -> Job {
    Job {
        id: id.to_string(),
        user_id: fallback.user_id.clone(),
        name: fallback.name.clone(),
        kind: match kind {
            ScrapeKind::Profile => JobKind::Profile,
            ScrapeKind::Company => JobKind::Company,
        },
        status: JobStatus::Completed,
        rotation_policy: RotationPolicy::default(),
        selected_accounts: Vec::new(),
        search_query: None,
        max_results: None,
        total_urls: 0,
        processed_urls: 0,
        successful_urls: 0,
        failed_urls: 0,
        auto_restarts: 0,
        error_message: None,
        created_at: now,
        started_at: Some(now),
        paused_at: None,
        resumed_at: None,
        completed_at: Some(now),
        updated_at: now,
    }
}

fn truncate_record(record: &ScrapeRecord) -> ScrapeRecord {
    match record {
        ScrapeRecord::Profile(p) => ScrapeRecord::Profile(ProfileRecord {
            full_name: truncate_optional(p.full_name.as_deref(), SHORT_TEXT_MAX_CHARS),
            headline: truncate_optional(p.headline.as_deref(), HEADLINE_MAX_CHARS),
            location: truncate_optional(p.location.as_deref(), SHORT_TEXT_MAX_CHARS),
            about: truncate_optional(p.about.as_deref(), LONG_TEXT_MAX_CHARS),
            current_company: truncate_optional(p.current_company.as_deref(), SHORT_TEXT_MAX_CHARS),
            ..p.clone()
        }),
        ScrapeRecord::Company(c) => ScrapeRecord::Company(CompanyRecord {
            name: truncate_optional(c.name.as_deref(), SHORT_TEXT_MAX_CHARS),
            industry: truncate_optional(c.industry.as_deref(), SHORT_TEXT_MAX_CHARS),
            company_size: truncate_optional(c.company_size.as_deref(), SHORT_TEXT_MAX_CHARS),
            headquarters: truncate_optional(c.headquarters.as_deref(), SHORT_TEXT_MAX_CHARS),
            website: truncate_optional(c.website.as_deref(), URL_MAX_CHARS),
            description: truncate_optional(c.description.as_deref(), LONG_TEXT_MAX_CHARS),
            ..c.clone()
        }),
    }
}
