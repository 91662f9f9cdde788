//! Job/account assignment repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{format_timestamp, get_timestamp, Database, DatabaseError};
use crate::jobs::JobAccountAssignment;

fn assignment_from_row(row: &Row<'_>) -> Result<JobAccountAssignment, rusqlite::Error> {
    Ok(JobAccountAssignment {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        account_id: row.get("account_id")?,
        assigned_urls: row.get("assigned_urls")?,
        processed_urls: row.get("processed_urls")?,
        successful_urls: row.get("successful_urls")?,
        status: row.get("status")?,
        created_at: get_timestamp(row, "created_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}

/// Creates or refreshes the assignment of `assigned` URLs to an account.
pub fn assign(
    db: &Database,
    job_id: &str,
    account_id: &str,
    assigned: u32,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_account_assignments (id, job_id, account_id, assigned_urls,
             status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
             ON CONFLICT (job_id, account_id) DO UPDATE SET
             assigned_urls = excluded.assigned_urls, status = 'active', updated_at = ?5",
            params![
                Uuid::new_v4().to_string(),
                job_id,
                account_id,
                assigned,
                now_s
            ],
        )?;
        Ok(())
    })
}

/// Counts a processed URL against the account that served it.
///
/// Accounts picked outside the initial pool get an assignment on first use.
pub fn record_processed(
    db: &Database,
    job_id: &str,
    account_id: &str,
    succeeded: bool,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_account_assignments (id, job_id, account_id, processed_urls,
             successful_urls, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, 'active', ?5, ?5)
             ON CONFLICT (job_id, account_id) DO UPDATE SET
             processed_urls = processed_urls + 1,
             successful_urls = successful_urls + ?4,
             updated_at = ?5",
            params![
                Uuid::new_v4().to_string(),
                job_id,
                account_id,
                i64::from(succeeded),
                now_s
            ],
        )?;
        Ok(())
    })
}

/// Marks every assignment of a job completed.
pub fn complete_for_job(
    db: &Database,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE job_account_assignments SET status = 'completed', updated_at = ?2
             WHERE job_id = ?1",
            params![job_id, now_s],
        )?;
        Ok(changed)
    })
}

/// Lists the assignments of a job ordered by account id.
pub fn list_by_job(
    db: &Database,
    job_id: &str,
) -> Result<Vec<JobAccountAssignment>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_account_assignments WHERE job_id = ?1 ORDER BY account_id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], assignment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
