//! Contract with the page scraper.
//!
//! Browser automation and field extraction live behind [`Scraper`]; the
//! orchestration core only sees successes and raw failures, which it
//! classifies itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::accounts::AccountCredentials;
use crate::results::ScrapeRecord;

/// Kind of page a URL points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeKind {
    Profile,
    Company,
}

impl ScrapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeKind::Profile => "profile",
            ScrapeKind::Company => "company",
        }
    }
}

/// A successfully extracted page.
#[derive(Debug, Clone)]
pub struct ScrapeSuccess {
    pub record: ScrapeRecord,
    pub raw_payload: Option<String>,
}

/// A failed scrape as reported by the scraper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub http_status: Option<u16>,
    pub message: String,
}

impl ScrapeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ScrapeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScrapeFailure {}

/// Fetches pages with an authenticated session.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Scrapes one page.
    async fn scrape(
        &self,
        url: &str,
        credentials: &AccountCredentials,
        kind: ScrapeKind,
    ) -> Result<ScrapeSuccess, ScrapeFailure>;

    /// Runs a people search and returns up to `max_results` profile URLs.
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        credentials: &AccountCredentials,
    ) -> Result<Vec<String>, ScrapeFailure>;
}
