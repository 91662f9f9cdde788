//! Job, job URL and assignment models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accounts::RotationPolicy;
use crate::scraper::ScrapeKind;

/// What a job collects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Profile,
    Company,
    /// A search query expanded into profile URLs when the job first runs.
    Search,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Profile => "profile",
            JobKind::Company => "company",
            JobKind::Search => "search",
        }
    }

    /// The page kind scraped for each URL of this job.
    pub fn scrape_kind(&self) -> ScrapeKind {
        match self {
            JobKind::Profile | JobKind::Search => ScrapeKind::Profile,
            JobKind::Company => ScrapeKind::Company,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(JobKind::Profile),
            "company" => Ok(JobKind::Company),
            "search" => Ok(JobKind::Search),
            other => Err(format!("Unknown job kind: {}", other)),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// A unit of scraping work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub rotation_policy: RotationPolicy,
    /// Account ids chosen by the user for `RotationPolicy::Manual`.
    #[serde(default)]
    pub selected_accounts: Vec<String>,
    pub search_query: Option<String>,
    pub max_results: Option<u32>,
    pub total_urls: u32,
    pub processed_urls: u32,
    pub successful_urls: u32,
    pub failed_urls: u32,
    pub auto_restarts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Share of processed URLs that failed, in `0.0..=1.0`.
    pub fn failure_rate(&self) -> f64 {
        if self.processed_urls == 0 {
            0.0
        } else {
            self.failed_urls as f64 / self.processed_urls as f64
        }
    }
}

/// Status of a single URL within a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Completed => "completed",
            UrlStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UrlStatus::Completed | UrlStatus::Failed)
    }
}

impl std::str::FromStr for UrlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UrlStatus::Pending),
            "processing" => Ok(UrlStatus::Processing),
            "completed" => Ok(UrlStatus::Completed),
            "failed" => Ok(UrlStatus::Failed),
            other => Err(format!("Unknown URL status: {}", other)),
        }
    }
}

/// One target URL within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUrl {
    pub id: String,
    pub job_id: String,
    /// Creation order within the job.
    pub position: u32,
    pub url: String,
    pub status: UrlStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub result_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link between a job and an account serving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccountAssignment {
    pub id: String,
    pub job_id: String,
    pub account_id: String,
    pub assigned_urls: u32,
    pub processed_urls: u32,
    pub successful_urls: u32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
