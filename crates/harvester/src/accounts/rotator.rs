//! Account selection across concurrent jobs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::health::{restrict_to_manual, AccountHealthStore};
use super::{Account, RotationPolicy};
use crate::db::DatabaseError;
use crate::jobs::{Job, JobKind};

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("No eligible accounts for user {user_id}{}", next_eligible_suffix(.earliest_eligible_at))]
    NoEligibleAccounts {
        user_id: String,
        earliest_eligible_at: Option<DateTime<Utc>>,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

fn next_eligible_suffix(at: &Option<DateTime<Utc>>) -> String {
    at.map(|t| format!(" (next eligible at {})", t.to_rfc3339()))
        .unwrap_or_default()
}

/// Inputs of one selection.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub user_id: String,
    pub kind: JobKind,
    pub policy: RotationPolicy,
    /// Accounts a `Manual` job is restricted to.
    pub manual_ids: Vec<String>,
    /// Account to pass over when any other is eligible.
    pub avoid_account_id: Option<String>,
}

impl SelectionRequest {
    pub fn for_job(job: &Job) -> Self {
        let manual_ids = if job.rotation_policy == RotationPolicy::Manual {
            job.selected_accounts.clone()
        } else {
            Vec::new()
        };
        Self {
            user_id: job.user_id.clone(),
            kind: job.kind,
            policy: job.rotation_policy,
            manual_ids,
            avoid_account_id: None,
        }
    }

    pub fn avoiding(mut self, account_id: &str) -> Self {
        self.avoid_account_id = Some(account_id.to_string());
        self
    }
}

/// Hands out accounts according to each job's rotation policy.
///
/// Selection and the `last_used_at` stamp happen under one lock, so two jobs
/// asking at the same moment see each other's choice.
pub struct AccountRotator {
    health: Arc<AccountHealthStore>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl AccountRotator {
    pub fn new(health: Arc<AccountHealthStore>) -> Self {
        Self {
            health,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> &Arc<AccountHealthStore> {
        &self.health
    }

    /// Picks the next account for `request` and marks it used.
    pub async fn next(&self, request: &SelectionRequest) -> Result<Account, RotationError> {
        let mut cursors = self.cursors.lock().await;
        let now = self.health.clock().now();
        let accounts = self.health.refreshed_accounts(&request.user_id, now)?;

        let eligible: Vec<Account> = accounts
            .iter()
            .filter(|a| a.is_eligible(now))
            .cloned()
            .collect();
        let mut candidates = restrict_to_manual(eligible, &request.manual_ids);
        if let Some(ref avoid) = request.avoid_account_id {
            if candidates.iter().any(|a| &a.id != avoid) {
                candidates.retain(|a| &a.id != avoid);
            }
        }

        let mut chosen = if candidates.is_empty() {
            self.over_ceiling(&accounts, request, now)?
        } else {
            match request.policy {
                RotationPolicy::LoadBalance => least_loaded(candidates),
                RotationPolicy::RoundRobin | RotationPolicy::Manual => {
                    let cursor = cursors.entry(request.user_id.clone()).or_insert(0);
                    let index = *cursor % candidates.len();
                    *cursor = index + 1;
                    candidates.swap_remove(index)
                }
            }
        };

        self.health.mark_used(&chosen.id)?;
        chosen.last_used_at = Some(now);
        tracing::debug!(
            user_id = %request.user_id,
            account_id = %chosen.id,
            policy = request.policy.as_str(),
            kind = request.kind.as_str(),
            "account selected"
        );
        Ok(chosen)
    }

    /// Whether [`next`](Self::next) could hand out an account other than
    /// `current_id`. Accounts over their daily limit count once nothing else
    /// is eligible.
    pub async fn has_alternate(
        &self,
        request: &SelectionRequest,
        current_id: &str,
    ) -> Result<bool, RotationError> {
        let _cursors = self.cursors.lock().await;
        let now = self.health.clock().now();
        let accounts = self.health.refreshed_accounts(&request.user_id, now)?;

        let eligible: Vec<Account> = accounts
            .iter()
            .filter(|a| a.is_eligible(now))
            .cloned()
            .collect();
        let mut pool = restrict_to_manual(eligible, &request.manual_ids);
        if pool.is_empty() {
            let usable: Vec<Account> = accounts
                .into_iter()
                .filter(|a| a.is_usable(now))
                .collect();
            pool = restrict_to_manual(usable, &request.manual_ids);
        }
        Ok(pool.iter().any(|a| a.id != current_id))
    }

    /// The daily ceiling is soft: when every healthy account is over it, the
    /// least used one still goes out.
    fn over_ceiling(
        &self,
        accounts: &[Account],
        request: &SelectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Account, RotationError> {
        let usable: Vec<Account> = accounts
            .iter()
            .filter(|a| a.is_usable(now))
            .cloned()
            .collect();
        let usable = restrict_to_manual(usable, &request.manual_ids);
        if !usable.is_empty() {
            let chosen = least_loaded(usable);
            tracing::warn!(
                user_id = %request.user_id,
                account_id = %chosen.id,
                requests_today = chosen.requests_today,
                daily_limit = chosen.daily_request_limit,
                "all healthy accounts are over their daily limit, using the least loaded"
            );
            return Ok(chosen);
        }

        let earliest_eligible_at = accounts.iter().filter_map(|a| a.eligible_again_at(now)).min();
        Err(RotationError::NoEligibleAccounts {
            user_id: request.user_id.clone(),
            earliest_eligible_at,
        })
    }
}

/// Fewest requests today; ties go to the least recently used, never-used first.
fn least_loaded(accounts: Vec<Account>) -> Account {
    let mut accounts = accounts;
    accounts.sort_by(|a, b| {
        a.requests_today
            .cmp(&b.requests_today)
            .then_with(|| a.last_used_at.cmp(&b.last_used_at))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    accounts.swap_remove(0)
}

/// Serialises scrapes that share an account.
///
/// Jobs may run concurrently while a single session still issues one request
/// at a time.
#[derive(Clone, Default)]
pub struct AccountLeases {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held from the pre-scrape eligibility check until the outcome is recorded.
pub struct AccountLease {
    account_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountLease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl AccountLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, account_id: &str) -> AccountLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(account_id.to_string()).or_default())
        };
        AccountLease {
            account_id: account_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }
}
