//! Account health bookkeeping.
//!
//! Every outcome of a scrape is folded into the account row: successes clear
//! the failure streak, failures open cooldown or block windows depending on
//! their kind.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::accounts::Account;
use crate::clock::Clock;
use crate::config::AccountsConfig;
use crate::db::account_repo::{self, HealthPenalty};
use crate::db::{Database, DatabaseError};
use crate::retry::FailureKind;

/// Windows and thresholds applied by [`AccountHealthStore`].
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub rate_limit_cooldown: Duration,
    pub max_rate_limit_cooldown: Duration,
    pub blocked_for: Duration,
    pub max_consecutive_failures: u32,
    pub soft_cooldown: Duration,
}

impl HealthPolicy {
    pub fn from_config(config: &AccountsConfig) -> Self {
        Self {
            rate_limit_cooldown: Duration::minutes(config.rate_limit_cooldown_mins as i64),
            max_rate_limit_cooldown: Duration::minutes(config.max_rate_limit_cooldown_mins as i64),
            blocked_for: Duration::hours(config.blocked_hours as i64),
            max_consecutive_failures: config.max_consecutive_failures,
            soft_cooldown: Duration::minutes(config.soft_cooldown_mins as i64),
        }
    }

    /// Cooldown after the `hits`-th rate limit in a row.
    ///
    /// Doubles per hit up to the maximum; a long failure streak jumps
    /// straight to the maximum.
    pub fn rate_limit_cooldown_for(&self, hits: u32, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.max_consecutive_failures {
            return self.max_rate_limit_cooldown;
        }
        let exponent = hits.saturating_sub(1).min(20);
        let scaled = self
            .rate_limit_cooldown
            .checked_mul(1i32 << exponent)
            .unwrap_or(self.max_rate_limit_cooldown);
        scaled.min(self.max_rate_limit_cooldown)
    }

    fn penalty(&self, kind: FailureKind, account: &Account, now: DateTime<Utc>) -> HealthPenalty {
        match kind {
            FailureKind::RateLimit => {
                let cooldown = self.rate_limit_cooldown_for(
                    account.rate_limit_hits,
                    account.consecutive_failures,
                );
                let until = now + cooldown;
                HealthPenalty {
                    cooldown_until: Some(account.cooldown_until.map_or(until, |c| c.max(until))),
                    ..Default::default()
                }
            }
            FailureKind::Authentication => HealthPenalty {
                validation_status: Some(crate::accounts::ValidationStatus::Invalid),
                ..Default::default()
            },
            FailureKind::Blocked => HealthPenalty {
                validation_status: Some(crate::accounts::ValidationStatus::Blocked),
                blocked_until: Some(now + self.blocked_for),
                ..Default::default()
            },
            FailureKind::Transient | FailureKind::Unknown => {
                if account.consecutive_failures >= self.max_consecutive_failures {
                    let until = now + self.soft_cooldown;
                    HealthPenalty {
                        cooldown_until: Some(
                            account.cooldown_until.map_or(until, |c| c.max(until)),
                        ),
                        ..Default::default()
                    }
                } else {
                    HealthPenalty::default()
                }
            }
            FailureKind::Validation => HealthPenalty::default(),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from_config(&AccountsConfig::default())
    }
}

/// Persists account health transitions.
pub struct AccountHealthStore {
    db: Database,
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
}

impl AccountHealthStore {
    pub fn new(db: Database, policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { db, policy, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn find(&self, account_id: &str) -> Result<Option<Account>, DatabaseError> {
        account_repo::find_by_id(&self.db, account_id)
    }

    /// Clears the failure streak and counts one request.
    pub fn record_success(&self, account_id: &str) -> Result<Option<Account>, DatabaseError> {
        let account = account_repo::record_success(&self.db, account_id, self.clock.now())?;
        if let Some(ref acc) = account {
            log::debug!(
                "Account {} succeeded ({} request(s) today)",
                acc.id,
                acc.requests_today
            );
        }
        Ok(account)
    }

    /// Counts a failure and applies the window its kind calls for.
    ///
    /// Validation failures are about the target, not the account, and leave
    /// the row untouched.
    pub fn record_failure(
        &self,
        account_id: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        if kind == FailureKind::Validation {
            return self.find(account_id);
        }
        let now = self.clock.now();
        let account = account_repo::record_failure(
            &self.db,
            account_id,
            message,
            kind == FailureKind::RateLimit,
            now,
            |counted| self.policy.penalty(kind, counted, now),
        )?;

        if let Some(ref acc) = account {
            match kind {
                FailureKind::Authentication => {
                    log::warn!("Account {} marked invalid: {}", acc.id, message)
                }
                FailureKind::Blocked => log::warn!(
                    "Account {} blocked until {:?}: {}",
                    acc.id,
                    acc.blocked_until,
                    message
                ),
                FailureKind::RateLimit => log::warn!(
                    "Account {} rate limited (hit {}), cooling down until {:?}",
                    acc.id,
                    acc.rate_limit_hits,
                    acc.cooldown_until
                ),
                _ => log::debug!(
                    "Account {} failure {} ({}): {}",
                    acc.id,
                    acc.consecutive_failures,
                    kind,
                    message
                ),
            }
        } else {
            log::warn!("Failure recorded for unknown account {}", account_id);
        }
        Ok(account)
    }

    pub fn mark_used(&self, account_id: &str) -> Result<(), DatabaseError> {
        account_repo::mark_used(&self.db, account_id, self.clock.now())
    }

    /// All accounts of a user after rolling expired daily windows and lifting
    /// expired blocks.
    pub fn refreshed_accounts(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>, DatabaseError> {
        account_repo::refresh_windows(&self.db, user_id, now)?;
        account_repo::list_by_user(&self.db, user_id)
    }

    /// Eligible accounts of a user, restricted to `manual_ids` when that
    /// subset has any eligible member.
    pub fn selectable_accounts(
        &self,
        user_id: &str,
        manual_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>, DatabaseError> {
        let eligible = self
            .refreshed_accounts(user_id, now)?
            .into_iter()
            .filter(|a| a.is_eligible(now))
            .collect();
        Ok(restrict_to_manual(eligible, manual_ids))
    }
}

/// Keeps only `manual_ids` unless that leaves nothing.
pub(crate) fn restrict_to_manual(accounts: Vec<Account>, manual_ids: &[String]) -> Vec<Account> {
    if manual_ids.is_empty() {
        return accounts;
    }
    let subset: Vec<Account> = accounts
        .iter()
        .filter(|a| manual_ids.contains(&a.id))
        .cloned()
        .collect();
    if subset.is_empty() {
        if !accounts.is_empty() {
            log::info!("No selected account is usable, falling back to the full pool");
        }
        accounts
    } else {
        subset
    }
}
