//! Account model and eligibility rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validation state of an account's session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Active,
    Pending,
    Blocked,
    /// Cookies were rejected; only an external refresh makes the account usable again.
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Active => "active",
            ValidationStatus::Pending => "pending",
            ValidationStatus::Blocked => "blocked",
            ValidationStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ValidationStatus::Active),
            "pending" => Ok(ValidationStatus::Pending),
            "blocked" => Ok(ValidationStatus::Blocked),
            "invalid" | "failed" => Ok(ValidationStatus::Invalid),
            other => Err(format!("Unknown validation status: {}", other)),
        }
    }
}

/// How the next account is chosen for a job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Advance a cursor over the eligible accounts.
    #[default]
    #[serde(alias = "auto_rotate")]
    RoundRobin,
    /// Pick the account with the fewest requests today.
    LoadBalance,
    /// Restrict to the job's selected accounts, falling back to the full pool.
    Manual,
}

impl RotationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPolicy::RoundRobin => "round_robin",
            RotationPolicy::LoadBalance => "load_balance",
            RotationPolicy::Manual => "manual",
        }
    }
}

impl std::str::FromStr for RotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "auto_rotate" => Ok(RotationPolicy::RoundRobin),
            "load_balance" => Ok(RotationPolicy::LoadBalance),
            "manual" => Ok(RotationPolicy::Manual),
            other => Err(format!("Unknown rotation policy: {}", other)),
        }
    }
}

/// A credential set usable for scraping, together with its health counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    /// Hex-encoded AES-GCM ciphertext of the session cookies.
    #[serde(skip_serializing)]
    pub encrypted_cookies: String,
    pub is_active: bool,
    pub validation_status: ValidationStatus,
    pub requests_today: u32,
    pub daily_request_limit: u32,
    /// When `requests_today` next rolls over.
    pub requests_reset_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Rate-limit signals since the last success; drives cooldown escalation.
    pub rate_limit_hits: u32,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Whether the account may be handed out right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_usable(now) && !self.is_over_daily_limit()
    }

    /// Eligibility ignoring the daily request ceiling.
    pub(crate) fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if matches!(
            self.validation_status,
            ValidationStatus::Blocked | ValidationStatus::Invalid
        ) {
            return false;
        }
        if self.cooldown_until.is_some_and(|until| until > now) {
            return false;
        }
        if self.blocked_until.is_some_and(|until| until > now) {
            return false;
        }
        true
    }

    pub fn is_over_daily_limit(&self) -> bool {
        self.requests_today >= self.daily_request_limit
    }

    /// When this account becomes eligible again through time alone.
    ///
    /// `None` for accounts that need outside action (deactivated or invalid
    /// cookies) and for accounts that are not waiting on any window.
    pub fn eligible_again_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active || self.validation_status == ValidationStatus::Invalid {
            return None;
        }
        let until = match (self.cooldown_until, self.blocked_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }?;
        if until > now {
            Some(until)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn account(id: &str, now: DateTime<Utc>) -> Account {
        Account {
            id: id.to_string(),
            user_id: "user-1".to_string(),
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
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::account;
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fresh_account_is_eligible() {
        let now = Utc::now();
        assert!(account("a", now).is_eligible(now));
    }

    #[test]
    fn test_future_windows_make_account_ineligible() {
        let now = Utc::now();

        let mut cooling = account("a", now);
        cooling.cooldown_until = Some(now + Duration::minutes(5));
        assert!(!cooling.is_eligible(now));
        assert!(cooling.is_eligible(now + Duration::minutes(5)));

        let mut blocked = account("b", now);
        blocked.blocked_until = Some(now + Duration::hours(1));
        assert!(!blocked.is_eligible(now));
    }

    #[test]
    fn test_status_and_limits() {
        let now = Utc::now();

        let mut invalid = account("a", now);
        invalid.validation_status = ValidationStatus::Invalid;
        assert!(!invalid.is_eligible(now));

        let mut inactive = account("b", now);
        inactive.is_active = false;
        assert!(!inactive.is_eligible(now));

        let mut busy = account("c", now);
        busy.requests_today = 100;
        assert!(!busy.is_eligible(now));
        assert!(busy.is_usable(now));

        let mut pending = account("d", now);
        pending.validation_status = ValidationStatus::Pending;
        assert!(pending.is_eligible(now));
    }

    #[test]
    fn test_eligible_again_at_takes_latest_window() {
        let now = Utc::now();
        let mut acc = account("a", now);
        acc.cooldown_until = Some(now + Duration::minutes(10));
        acc.blocked_until = Some(now + Duration::hours(2));
        assert_eq!(acc.eligible_again_at(now), Some(now + Duration::hours(2)));

        acc.validation_status = ValidationStatus::Invalid;
        assert_eq!(acc.eligible_again_at(now), None);
    }

    #[test]
    fn test_rotation_policy_parsing() {
        assert_eq!(
            "auto_rotate".parse::<RotationPolicy>().unwrap(),
            RotationPolicy::RoundRobin
        );
        let parsed: RotationPolicy = serde_json::from_str("\"auto_rotate\"").unwrap();
        assert_eq!(parsed, RotationPolicy::RoundRobin);
        assert!("random".parse::<RotationPolicy>().is_err());
        assert_eq!(
            "failed".parse::<ValidationStatus>().unwrap(),
            ValidationStatus::Invalid
        );
    }
}
