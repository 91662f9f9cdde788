//! Failure classification at the scraper boundary.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::scraper::ScrapeFailure;

/// Why a scrape failed, as far as retry and account health are concerned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network trouble, timeouts, server errors.
    Transient,
    /// Session rejected; the account's cookies are no longer valid.
    Authentication,
    RateLimit,
    Blocked,
    /// The target itself is bad; retrying cannot help.
    Validation,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Authentication => "authentication",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Blocked => "blocked",
            FailureKind::Validation => "validation",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Failures caused by the account rather than the target or the network.
    pub fn is_account_attributable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimit | FailureKind::Authentication | FailureKind::Blocked
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static STATUS_429: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b429\b").unwrap());
static STATUS_401: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b401\b").unwrap());
static STATUS_403: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b403\b").unwrap());

const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "rate-limit", "too many requests"];
const AUTH_PHRASES: &[&str] = &[
    "authentication",
    "unauthorized",
    "login",
    "invalid cookies",
    "invalid_cookies",
    "session expired",
];
const BLOCKED_PHRASES: &[&str] = &["blocked", "forbidden", "restricted"];
const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "reset by peer",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Maps a scraper failure onto a [`FailureKind`].
///
/// The HTTP status wins when present; otherwise the message is inspected,
/// checking rate limiting before authentication before blocking.
pub fn classify(failure: &ScrapeFailure) -> FailureKind {
    if let Some(status) = failure.http_status {
        match status {
            429 => return FailureKind::RateLimit,
            401 => return FailureKind::Authentication,
            403 => return FailureKind::Blocked,
            408 | 500..=599 => return FailureKind::Transient,
            400 | 404 | 410 | 422 => return FailureKind::Validation,
            _ => {}
        }
    }

    let message = failure.message.to_lowercase();
    if contains_any(&message, RATE_LIMIT_PHRASES) || STATUS_429.is_match(&message) {
        FailureKind::RateLimit
    } else if contains_any(&message, AUTH_PHRASES) || STATUS_401.is_match(&message) {
        FailureKind::Authentication
    } else if contains_any(&message, BLOCKED_PHRASES) || STATUS_403.is_match(&message) {
        FailureKind::Blocked
    } else if contains_any(&message, TRANSIENT_PHRASES) {
        FailureKind::Transient
    } else {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (429, FailureKind::RateLimit),
            (401, FailureKind::Authentication),
            (403, FailureKind::Blocked),
            (408, FailureKind::Transient),
            (503, FailureKind::Transient),
            (404, FailureKind::Validation),
            (422, FailureKind::Validation),
        ];
        for (status, expected) in cases {
            assert_eq!(
                classify(&ScrapeFailure::with_status(status, "")),
                expected,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_status_beats_message() {
        let failure = ScrapeFailure::with_status(503, "login wall shown");
        assert_eq!(classify(&failure), FailureKind::Transient);
    }

    #[test]
    fn test_message_phrases() {
        let cases = [
            ("Rate limit exceeded", FailureKind::RateLimit),
            ("server said 429", FailureKind::RateLimit),
            ("Redirected to login page", FailureKind::Authentication),
            ("Session expired", FailureKind::Authentication),
            ("got 401 back", FailureKind::Authentication),
            ("Account blocked by checkpoint", FailureKind::Blocked),
            ("403", FailureKind::Blocked),
            ("Navigation timeout of 30000 ms exceeded", FailureKind::Transient),
            ("connection refused", FailureKind::Transient),
            ("selector not found", FailureKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&ScrapeFailure::new(message)), expected, "{}", message);
        }
    }

    #[test]
    fn test_codes_need_word_boundaries() {
        assert_eq!(
            classify(&ScrapeFailure::new("element id 14290 missing")),
            FailureKind::Unknown
        );
    }

    #[test]
    fn test_account_attribution() {
        assert!(FailureKind::Blocked.is_account_attributable());
        assert!(!FailureKind::Transient.is_account_attributable());
        assert!(!FailureKind::Validation.is_account_attributable());
    }
}
