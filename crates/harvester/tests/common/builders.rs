//! Builders for accounts and jobs.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};

use harvester::accounts::{Account, RotationPolicy, ValidationStatus};
use harvester::jobs::{JobKind, NewJob};

pub const USER: &str = "user-1";

/// Builder for `Account` rows.
pub struct AccountBuilder {
    account: Account,
}

impl AccountBuilder {
    /// A healthy account created `age_mins` minutes before `now`.
    ///
    /// Older accounts sort first, which makes round-robin order predictable.
    pub fn new(id: &str, now: DateTime<Utc>, age_mins: i64) -> Self {
        let created_at = now - Duration::minutes(age_mins);
        Self {
            account: Account {
                id: id.to_string(),
                user_id: USER.to_string(),
                name: format!("Account {}", id),
                email: Some(format!("{}@example.com", id)),
                encrypted_cookies: String::new(),
                is_active: true,
                validation_status: ValidationStatus::Active,
                requests_today: 0,
                daily_request_limit: 100,
                requests_reset_at: None,
                cooldown_until: None,
                blocked_until: None,
                consecutive_failures: 0,
                rate_limit_hits: 0,
                last_error: None,
                last_used_at: None,
                created_at,
                updated_at: created_at,
            },
        }
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.account.user_id = user_id.to_string();
        self
    }

    pub fn blocked_until(mut self, until: DateTime<Utc>) -> Self {
        self.account.validation_status = ValidationStatus::Blocked;
        self.account.blocked_until = Some(until);
        self
    }

    pub fn cooling_down_until(mut self, until: DateTime<Utc>) -> Self {
        self.account.cooldown_until = Some(until);
        self
    }

    pub fn invalid(mut self) -> Self {
        self.account.validation_status = ValidationStatus::Invalid;
        self
    }

    pub fn build(self) -> Account {
        self.account
    }
}

/// `https://www.linkedin.com/in/person-{i}` for `i` in `0..count`.
pub fn profile_urls(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("https://www.linkedin.com/in/person-{}", i))
        .collect()
}

pub fn profile_job(name: &str, urls: Vec<String>) -> NewJob {
    NewJob::new(USER, name, JobKind::Profile).with_urls(urls)
}

pub fn company_job(name: &str, urls: Vec<String>) -> NewJob {
    NewJob::new(USER, name, JobKind::Company).with_urls(urls)
}

pub fn search_job(name: &str, query: &str, max_results: Option<u32>) -> NewJob {
    NewJob::new(USER, name, JobKind::Search).with_search(query, max_results)
}

pub fn manual_job(name: &str, urls: Vec<String>, accounts: &[&str]) -> NewJob {
    profile_job(name, urls).with_rotation(
        RotationPolicy::Manual,
        accounts.iter().map(|a| a.to_string()).collect(),
    )
}
