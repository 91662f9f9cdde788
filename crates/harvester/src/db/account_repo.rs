//! Account repository: rows of the `accounts` table and their health counters.
//!
//! Every mutation that depends on the current counters runs inside a single
//! `with_conn` closure, so concurrent jobs sharing an account never lose an
//! increment.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    format_optional, format_timestamp, get_optional_timestamp, get_parsed, get_timestamp,
    Database, DatabaseError,
};
use crate::accounts::{Account, ValidationStatus};

/// Length of the daily request window.
pub const DAILY_WINDOW_HOURS: i64 = 24;

fn account_from_row(row: &Row<'_>) -> Result<Account, rusqlite::Error> {
    Ok(Account {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        email: row.get("email")?,
        encrypted_cookies: row.get("encrypted_cookies")?,
        is_active: row.get("is_active")?,
        validation_status: get_parsed(row, "validation_status")?,
        requests_today: row.get("requests_today")?,
        daily_request_limit: row.get("daily_request_limit")?,
        requests_reset_at: get_optional_timestamp(row, "requests_reset_at")?,
        cooldown_until: get_optional_timestamp(row, "cooldown_until")?,
        blocked_until: get_optional_timestamp(row, "blocked_until")?,
        consecutive_failures: row.get("consecutive_failures")?,
        rate_limit_hits: row.get("rate_limit_hits")?,
        last_error: row.get("last_error")?,
        last_used_at: get_optional_timestamp(row, "last_used_at")?,
        created_at: get_timestamp(row, "created_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}

/// Penalty applied after a failure has been counted.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HealthPenalty {
    pub cooldown_until: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub validation_status: Option<ValidationStatus>,
}

/// Inserts a new account row.
pub fn insert(db: &Database, account: &Account) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO accounts (id, user_id, name, email, encrypted_cookies, is_active,
             validation_status, requests_today, daily_request_limit, requests_reset_at,
             cooldown_until, blocked_until, consecutive_failures, rate_limit_hits, last_error,
             last_used_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                account.id,
                account.user_id,
                account.name,
                account.email,
                account.encrypted_cookies,
                account.is_active,
                account.validation_status.as_str(),
                account.requests_today,
                account.daily_request_limit,
                format_optional(account.requests_reset_at),
                format_optional(account.cooldown_until),
                format_optional(account.blocked_until),
                account.consecutive_failures,
                account.rate_limit_hits,
                account.last_error,
                format_optional(account.last_used_at),
                format_timestamp(account.created_at),
                format_timestamp(account.updated_at),
            ],
        )?;
        Ok(())
    })
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<Account>, DatabaseError> {
    let account = conn
        .query_row(
            "SELECT * FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

/// Finds an account by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Account>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Lists all accounts of a user in creation order.
pub fn list_by_user(db: &Database, user_id: &str) -> Result<Vec<Account>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM accounts WHERE user_id = ?1 ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map(params![user_id], account_from_row)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    })
}

/// Rolls over expired daily windows and lifts expired blocks for a user.
///
/// Accounts without a window get one starting now; their counter is kept.
/// Returns the number of rows touched.
pub fn refresh_windows(
    db: &Database,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let now_s = format_timestamp(now);
    let next_reset = format_timestamp(now + Duration::hours(DAILY_WINDOW_HOURS));
    db.with_conn(|conn| {
        let mut touched = conn.execute(
            "UPDATE accounts SET requests_today = 0, requests_reset_at = ?3, updated_at = ?2
             WHERE user_id = ?1 AND requests_reset_at IS NOT NULL AND requests_reset_at <= ?2",
            params![user_id, now_s, next_reset],
        )?;
        touched += conn.execute(
            "UPDATE accounts SET requests_reset_at = ?3, updated_at = ?2
             WHERE user_id = ?1 AND requests_reset_at IS NULL",
            params![user_id, now_s, next_reset],
        )?;
        let restored = conn.execute(
            "UPDATE accounts SET validation_status = 'active', blocked_until = NULL,
             consecutive_failures = 0, updated_at = ?2
             WHERE user_id = ?1 AND validation_status = 'blocked'
             AND blocked_until IS NOT NULL AND blocked_until <= ?2",
            params![user_id, now_s],
        )?;
        if restored > 0 {
            log::info!("Restored {} blocked account(s) for user {}", restored, user_id);
        }
        Ok(touched + restored)
    })
}

/// Records a successful request: failure counters cleared, request counted.
///
/// A `pending` account is promoted to `active` by its first success.
pub fn record_success(
    db: &Database,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Account>, DatabaseError> {
    let now_s = format_timestamp(now);
    let next_reset = format_timestamp(now + Duration::hours(DAILY_WINDOW_HOURS));
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE accounts SET requests_today = 0, requests_reset_at = ?3
             WHERE id = ?1 AND (requests_reset_at IS NULL OR requests_reset_at <= ?2)",
            params![id, now_s, next_reset],
        )?;
        conn.execute(
            "UPDATE accounts SET consecutive_failures = 0, rate_limit_hits = 0, last_error = NULL,
             requests_today = requests_today + 1, last_used_at = ?2, updated_at = ?2,
             validation_status = CASE WHEN validation_status = 'pending' THEN 'active'
                                      ELSE validation_status END
             WHERE id = ?1",
            params![id, now_s],
        )?;
        find_in(conn, id)
    })
}

/// Counts a failure and applies the penalty computed from the updated row.
///
/// The increment, the penalty decision and its write happen under one lock.
pub fn record_failure<F>(
    db: &Database,
    id: &str,
    message: &str,
    rate_limited: bool,
    now: DateTime<Utc>,
    penalty: F,
) -> Result<Option<Account>, DatabaseError>
where
    F: FnOnce(&Account) -> HealthPenalty,
{
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE accounts SET consecutive_failures = consecutive_failures + 1,
             rate_limit_hits = rate_limit_hits + ?3, last_error = ?2, updated_at = ?4
             WHERE id = ?1",
            params![id, message, i64::from(rate_limited), now_s],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let Some(counted) = find_in(conn, id)? else {
            return Ok(None);
        };

        let change = penalty(&counted);
        if change == HealthPenalty::default() {
            return Ok(Some(counted));
        }
        conn.execute(
            "UPDATE accounts SET cooldown_until = COALESCE(?2, cooldown_until),
             blocked_until = COALESCE(?3, blocked_until),
             validation_status = COALESCE(?4, validation_status)
             WHERE id = ?1",
            params![
                id,
                format_optional(change.cooldown_until),
                format_optional(change.blocked_until),
                change.validation_status.map(|s| s.as_str()),
            ],
        )?;
        find_in(conn, id)
    })
}

/// Sets `last_used_at` without counting a request.
pub fn mark_used(db: &Database, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE accounts SET last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, now_s],
        )?;
        Ok(())
    })
}

/// Replaces the stored cookies and puts the account back into `pending`.
pub fn update_cookies(
    db: &Database,
    id: &str,
    encrypted_cookies: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE accounts SET encrypted_cookies = ?2, validation_status = 'pending',
             consecutive_failures = 0, last_error = NULL, updated_at = ?3
             WHERE id = ?1",
            params![id, encrypted_cookies, now_s],
        )?;
        Ok(changed > 0)
    })
}

/// Enables or disables an account.
pub fn set_active(
    db: &Database,
    id: &str,
    active: bool,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE accounts SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, now_s],
        )?;
        Ok(changed > 0)
    })
}
