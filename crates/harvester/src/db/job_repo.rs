//! Job repository: CRUD and lifecycle updates for the `jobs` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    format_optional, format_timestamp, get_optional_timestamp, get_parsed, get_timestamp,
    Database, DatabaseError,
};
use crate::jobs::{Job, JobStatus};

fn selected_accounts_from_row(row: &Row<'_>) -> Result<Vec<String>, rusqlite::Error> {
    let raw: Option<String> = row.get("selected_accounts")?;
    match raw.as_deref() {
        None | Some("") => Ok(Vec::new()),
        Some(json) => serde_json::from_str(json).map_err(|e| {
            let index = row.as_ref().column_index("selected_accounts").unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
        }),
    }
}

pub(crate) fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    Ok(Job {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        kind: get_parsed(row, "kind")?,
        status: get_parsed(row, "status")?,
        rotation_policy: get_parsed(row, "rotation_policy")?,
        selected_accounts: selected_accounts_from_row(row)?,
        search_query: row.get("search_query")?,
        max_results: row.get("max_results")?,
        total_urls: row.get("total_urls")?,
        processed_urls: row.get("processed_urls")?,
        successful_urls: row.get("successful_urls")?,
        failed_urls: row.get("failed_urls")?,
        auto_restarts: row.get("auto_restarts")?,
        error_message: row.get("error_message")?,
        created_at: get_timestamp(row, "created_at")?,
        started_at: get_optional_timestamp(row, "started_at")?,
        paused_at: get_optional_timestamp(row, "paused_at")?,
        resumed_at: get_optional_timestamp(row, "resumed_at")?,
        completed_at: get_optional_timestamp(row, "completed_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}

/// Inserts a job row on an open connection or transaction.
pub(crate) fn insert_in(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let selected = if job.selected_accounts.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&job.selected_accounts).map_err(|source| {
                DatabaseError::Encode {
                    column: "selected_accounts",
                    source,
                }
            })?,
        )
    };
    conn.execute(
        "INSERT INTO jobs (id, user_id, name, kind, status, rotation_policy, selected_accounts,
         search_query, max_results, total_urls, processed_urls, successful_urls, failed_urls,
         auto_restarts, error_message, created_at, started_at, paused_at, resumed_at,
         completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21)",
        params![
            job.id,
            job.user_id,
            job.name,
            job.kind.as_str(),
            job.status.as_str(),
            job.rotation_policy.as_str(),
            selected,
            job.search_query,
            job.max_results,
            job.total_urls,
            job.processed_urls,
            job.successful_urls,
            job.failed_urls,
            job.auto_restarts,
            job.error_message,
            format_timestamp(job.created_at),
            format_optional(job.started_at),
            format_optional(job.paused_at),
            format_optional(job.resumed_at),
            format_optional(job.completed_at),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

pub(crate) fn find_in(conn: &Connection, id: &str) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
        .optional()?;
    Ok(job)
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Lists every job with the given status, oldest first.
pub fn list_by_status(db: &Database, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC")?;
        let rows = stmt
            .query_map(params![status.as_str()], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Marks a job running.
///
/// The first start sets `started_at`; later starts set `resumed_at`. Any
/// pause reason left in `error_message` is cleared.
pub fn mark_running(
    db: &Database,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'running',
             started_at = COALESCE(started_at, ?2),
             resumed_at = CASE WHEN started_at IS NULL THEN resumed_at ELSE ?2 END,
             error_message = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now_s],
        )?;
        find_in(conn, id)
    })
}

/// Sets the status of a job together with the timestamp that status implies.
///
/// `paused` stamps `paused_at`; terminal statuses stamp `completed_at`.
/// `error_message` is overwritten, so `None` clears a previous message.
pub fn set_status(
    db: &Database,
    id: &str,
    status: JobStatus,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now_s = format_timestamp(now);
    let paused_at = (status == JobStatus::Paused).then(|| now_s.clone());
    let completed_at = status.is_terminal().then(|| now_s.clone());
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, error_message = ?3,
             paused_at = COALESCE(?4, paused_at),
             completed_at = ?5,
             updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                error_message,
                paused_at,
                completed_at,
                now_s
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Sets the status only when the job is currently in `expected`.
///
/// Returns whether the row changed; used where a concurrent writer may have
/// moved the job on already.
pub fn transition(
    db: &Database,
    id: &str,
    expected: JobStatus,
    status: JobStatus,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now_s = format_timestamp(now);
    let completed_at = status.is_terminal().then(|| now_s.clone());
    let paused_at = (status == JobStatus::Paused).then(|| now_s.clone());
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, completed_at = COALESCE(?4, completed_at),
             paused_at = COALESCE(?5, paused_at), updated_at = ?6
             WHERE id = ?1 AND status = ?2",
            params![
                id,
                expected.as_str(),
                status.as_str(),
                completed_at,
                paused_at,
                now_s
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Moves every `running` job back to `pending`. Returns the affected count.
pub fn recover_running(db: &Database, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
            params![now_s],
        )?;
        if changed > 0 {
            log::info!("Recovered {} interrupted job(s)", changed);
        }
        Ok(changed)
    })
}

/// Failed jobs eligible for an automatic restart, oldest failure first.
pub fn restartable_failed(
    db: &Database,
    failed_since: DateTime<Utc>,
    max_auto_restarts: u32,
    limit: u32,
) -> Result<Vec<Job>, DatabaseError> {
    let since_s = format_timestamp(failed_since);
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'failed' AND updated_at >= ?1
             AND auto_restarts < ?2 ORDER BY updated_at ASC, id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![since_s, max_auto_restarts, limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts one more automatic restart of a job.
pub fn increment_auto_restarts(
    db: &Database,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET auto_restarts = auto_restarts + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_s],
        )?;
        Ok(())
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::accounts::RotationPolicy;
    use crate::jobs::JobKind;

    pub fn sample_job(id: &str, now: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: format!("Job {}", id),
            kind: JobKind::Profile,
            status: JobStatus::Pending,
            rotation_policy: RotationPolicy::RoundRobin,
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
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_job;
    use super::*;
    use crate::accounts::RotationPolicy;
    use chrono::Duration;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let mut job = sample_job("job-1", now());
        job.rotation_policy = RotationPolicy::Manual;
        job.selected_accounts = vec!["a1".to_string(), "a2".to_string()];
        insert(&db, &job).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.rotation_policy, RotationPolicy::Manual);
        assert_eq!(found.selected_accounts, vec!["a1", "a2"]);
        assert_eq!(found.created_at, now());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_unknown_status_surfaces_as_error() {
        let db = test_db();
        insert(&db, &sample_job("job-1", now())).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE jobs SET status = 'exploded' WHERE id = 'job-1'", [])?;
            Ok(())
        })
        .unwrap();
        assert!(find_by_id(&db, "job-1").is_err());
    }

    #[test]
    fn test_mark_running_stamps_started_then_resumed() {
        let db = test_db();
        insert(&db, &sample_job("job-1", now())).unwrap();

        let first = mark_running(&db, "job-1", now()).unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.started_at, Some(now()));
        assert_eq!(first.resumed_at, None);

        let later = now() + Duration::minutes(5);
        set_status(&db, "job-1", JobStatus::Paused, Some("manual"), later).unwrap();
        let second = mark_running(&db, "job-1", later).unwrap().unwrap();
        assert_eq!(second.started_at, Some(now()));
        assert_eq!(second.resumed_at, Some(later));
        assert_eq!(second.error_message, None);
        assert_eq!(second.paused_at, Some(later));
    }

    #[test]
    fn test_set_status_terminal_stamps_completed_at() {
        let db = test_db();
        insert(&db, &sample_job("job-1", now())).unwrap();
        set_status(&db, "job-1", JobStatus::Failed, Some("boom"), now()).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.completed_at, Some(now()));
        assert_eq!(found.error_message.as_deref(), Some("boom"));

        set_status(&db, "job-1", JobStatus::Pending, None, now()).unwrap();
        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.completed_at, None);
        assert_eq!(found.error_message, None);
    }

    #[test]
    fn test_transition_requires_expected_status() {
        let db = test_db();
        insert(&db, &sample_job("job-1", now())).unwrap();
        assert!(!transition(&db, "job-1", JobStatus::Running, JobStatus::Paused, now()).unwrap());
        assert!(transition(&db, "job-1", JobStatus::Pending, JobStatus::Cancelled, now()).unwrap());
        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Cancelled);
        assert!(found.completed_at.is_some());
    }

    #[test]
    fn test_recover_running() {
        let db = test_db();
        let mut running = sample_job("r1", now());
        running.status = JobStatus::Running;
        insert(&db, &running).unwrap();
        insert(&db, &sample_job("p1", now())).unwrap();

        assert_eq!(recover_running(&db, now()).unwrap(), 1);
        assert_eq!(list_by_status(&db, JobStatus::Pending).unwrap().len(), 2);
    }

    #[test]
    fn test_restartable_failed_respects_window_and_counter() {
        let db = test_db();
        let rows = [("old", 120, 0), ("f1", 30, 0), ("f2", 10, 0), ("done", 5, 1)];
        for (id, minutes_ago, restarts) in rows {
            let mut job = sample_job(id, now());
            job.status = JobStatus::Failed;
            job.auto_restarts = restarts;
            job.updated_at = now() - Duration::minutes(minutes_ago);
            insert(&db, &job).unwrap();
        }

        let ids: Vec<String> = restartable_failed(&db, now() - Duration::minutes(60), 1, 5)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);

        let limited = restartable_failed(&db, now() - Duration::minutes(60), 1, 1).unwrap();
        assert_eq!(limited.len(), 1);

        increment_auto_restarts(&db, "f1", now()).unwrap();
        assert_eq!(find_by_id(&db, "f1").unwrap().unwrap().auto_restarts, 1);
    }
}
