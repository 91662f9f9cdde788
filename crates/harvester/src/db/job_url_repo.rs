//! Job URL repository.
//!
//! A URL's terminal disposition and the owning job's counters are written in
//! one transaction with a single counter statement, which keeps
//! `processed = successful + failed` true at every observable point.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{format_timestamp, get_parsed, get_timestamp, job_repo, Database, DatabaseError};
use crate::jobs::{Job, JobUrl, UrlStatus};

fn job_url_from_row(row: &Row<'_>) -> Result<JobUrl, rusqlite::Error> {
    Ok(JobUrl {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        position: row.get("position")?,
        url: row.get("url")?,
        status: get_parsed(row, "status")?,
        attempts: row.get("attempts")?,
        error_message: row.get("error_message")?,
        result_id: row.get("result_id")?,
        created_at: get_timestamp(row, "created_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}

/// Builds a pending URL row.
pub fn new_url(job_id: &str, position: u32, url: &str, now: DateTime<Utc>) -> JobUrl {
    JobUrl {
        id: Uuid::new_v4().to_string(),
        job_id: job_id.to_string(),
        position,
        url: url.to_string(),
        status: UrlStatus::Pending,
        attempts: 0,
        error_message: None,
        result_id: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn insert_in(conn: &Connection, url: &JobUrl) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_urls (id, job_id, position, url, status, attempts, error_message,
         result_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            url.id,
            url.job_id,
            url.position,
            url.url,
            url.status.as_str(),
            url.attempts,
            url.error_message,
            url.result_id,
            format_timestamp(url.created_at),
            format_timestamp(url.updated_at),
        ],
    )?;
    Ok(())
}

/// Lists the URLs of a job in creation order.
pub fn list_by_job(db: &Database, job_id: &str) -> Result<Vec<JobUrl>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM job_urls WHERE job_id = ?1 ORDER BY position ASC")?;
        let rows = stmt
            .query_map(params![job_id], job_url_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds a URL by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobUrl>, DatabaseError> {
    db.with_conn(|conn| {
        let url = conn
            .query_row(
                "SELECT * FROM job_urls WHERE id = ?1",
                params![id],
                job_url_from_row,
            )
            .optional()?;
        Ok(url)
    })
}

pub(crate) fn exists_in(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row("SELECT 1 FROM job_urls WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Counts the URLs of a job.
pub fn count_by_job(db: &Database, job_id: &str) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM job_urls WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Appends URLs after the job's last position and sets `total_urls` to the
/// new URL count. Returns the inserted rows.
pub fn append(
    db: &Database,
    job_id: &str,
    urls: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<JobUrl>, DatabaseError> {
    db.transaction(|tx| {
        let next: u32 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM job_urls WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        let mut inserted = Vec::with_capacity(urls.len());
        for (offset, url) in urls.iter().enumerate() {
            let row = new_url(job_id, next + offset as u32, url, now);
            insert_in(tx, &row)?;
            inserted.push(row);
        }
        tx.execute(
            "UPDATE jobs SET total_urls = (SELECT COUNT(*) FROM job_urls WHERE job_id = ?1),
             updated_at = ?2 WHERE id = ?1",
            params![job_id, format_timestamp(now)],
        )?;
        Ok(inserted)
    })
}

/// Marks a URL as processing and counts an attempt. Returns the new count.
pub fn begin_attempt(db: &Database, id: &str, now: DateTime<Utc>) -> Result<u32, DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE job_urls SET status = 'processing', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1",
            params![id, now_s],
        )?;
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM job_urls WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(attempts)
    })
}

/// Records an attempt failure message without a terminal disposition.
pub fn note_error(
    db: &Database,
    id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now_s = format_timestamp(now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE job_urls SET error_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, message, now_s],
        )?;
        Ok(())
    })
}

/// Completes a URL with its stored result and counts a success on the job.
///
/// A URL already in a terminal state is left alone and no counter moves.
pub fn complete(
    db: &Database,
    id: &str,
    result_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    settle(db, id, UrlStatus::Completed, Some(result_id), None, now)
}

/// Fails a URL with its last error and counts a failure on the job.
pub fn fail(
    db: &Database,
    id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    settle(db, id, UrlStatus::Failed, None, Some(message), now)
}

fn settle(
    db: &Database,
    id: &str,
    status: UrlStatus,
    result_id: Option<&str>,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let now_s = format_timestamp(now);
    db.transaction(|tx| {
        let job_id: Option<String> = tx
            .query_row(
                "SELECT job_id FROM job_urls WHERE id = ?1
                 AND status NOT IN ('completed', 'failed')",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(job_id) = job_id else {
            log::warn!("URL {} is missing or already settled", id);
            return Ok(None);
        };

        tx.execute(
            "UPDATE job_urls SET status = ?2, result_id = COALESCE(?3, result_id),
             error_message = CASE WHEN ?2 = 'completed' THEN NULL ELSE ?4 END, updated_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), result_id, message, now_s],
        )?;
        let succeeded = i64::from(status == UrlStatus::Completed);
        tx.execute(
            "UPDATE jobs SET processed_urls = processed_urls + 1,
             successful_urls = successful_urls + ?2,
             failed_urls = failed_urls + (1 - ?2),
             updated_at = ?3
             WHERE id = ?1",
            params![job_id, succeeded, now_s],
        )?;
        job_repo::find_in(tx, &job_id)
    })
}

/// Resets every failed URL of a job to pending and takes them back out of
/// the job's counters. Returns the number of URLs reset.
pub(crate) fn reset_failed_in(
    conn: &Connection,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<u32, DatabaseError> {
    let now_s = format_timestamp(now);
    let reset = conn.execute(
        "UPDATE job_urls SET status = 'pending', attempts = 0, error_message = NULL,
         updated_at = ?2 WHERE job_id = ?1 AND status = 'failed'",
        params![job_id, now_s],
    )? as u32;
    conn.execute(
        "UPDATE jobs SET failed_urls = MAX(failed_urls - ?2, 0),
         processed_urls = MAX(processed_urls - ?2, 0),
         status = 'pending', error_message = NULL, completed_at = NULL, updated_at = ?3
         WHERE id = ?1",
        params![job_id, reset, now_s],
    )?;
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::fixtures::sample_job;
    use crate::jobs::JobStatus;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seed(db: &Database, urls: &[&str]) -> Vec<JobUrl> {
        job_repo::insert(db, &sample_job("job-1", now())).unwrap();
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        append(db, "job-1", &urls, now()).unwrap()
    }

    #[test]
    fn test_append_keeps_order_and_updates_total() {
        let db = test_db();
        seed(&db, &["https://a", "https://b"]);
        append(&db, "job-1", &["https://c".to_string()], now()).unwrap();

        let urls = list_by_job(&db, "job-1").unwrap();
        let positions: Vec<u32> = urls.iter().map(|u| u.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(urls[2].url, "https://c");
        let job = job_repo::find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.total_urls, 3);
        assert_eq!(count_by_job(&db, "job-1").unwrap(), 3);
    }

    #[test]
    fn test_begin_attempt_counts() {
        let db = test_db();
        let urls = seed(&db, &["https://a"]);
        assert_eq!(begin_attempt(&db, &urls[0].id, now()).unwrap(), 1);
        assert_eq!(begin_attempt(&db, &urls[0].id, now()).unwrap(), 2);
        let url = find_by_id(&db, &urls[0].id).unwrap().unwrap();
        assert_eq!(url.status, UrlStatus::Processing);
    }

    #[test]
    fn test_settle_updates_counters_once() {
        let db = test_db();
        let urls = seed(&db, &["https://a", "https://b"]);

        let job = complete(&db, &urls[0].id, "r1", now()).unwrap().unwrap();
        assert_eq!((job.processed_urls, job.successful_urls, job.failed_urls), (1, 1, 0));

        let job = fail(&db, &urls[1].id, "gone", now()).unwrap().unwrap();
        assert_eq!((job.processed_urls, job.successful_urls, job.failed_urls), (2, 1, 1));

        // settling twice is a no-op
        assert!(fail(&db, &urls[1].id, "again", now()).unwrap().is_none());
        let job = job_repo::find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.processed_urls, job.successful_urls + job.failed_urls);
        assert_eq!(job.processed_urls, 2);

        let done = find_by_id(&db, &urls[0].id).unwrap().unwrap();
        assert_eq!(done.result_id.as_deref(), Some("r1"));
        let failed = find_by_id(&db, &urls[1].id).unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("gone"));
    }

    #[test]
    fn test_reset_failed_restores_counters() {
        let db = test_db();
        let urls = seed(&db, &["https://a", "https://b", "https://c"]);
        complete(&db, &urls[0].id, "r1", now()).unwrap();
        begin_attempt(&db, &urls[1].id, now()).unwrap();
        fail(&db, &urls[1].id, "x", now()).unwrap();
        fail(&db, &urls[2].id, "y", now()).unwrap();
        job_repo::set_status(&db, "job-1", JobStatus::Completed, Some("2 failed"), now())
            .unwrap();

        let reset = db
            .transaction(|tx| reset_failed_in(tx, "job-1", now()))
            .unwrap();
        assert_eq!(reset, 2);

        let job = job_repo::find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!((job.processed_urls, job.successful_urls, job.failed_urls), (1, 1, 0));
        assert_eq!(job.error_message, None);

        let url = find_by_id(&db, &urls[1].id).unwrap().unwrap();
        assert_eq!(url.status, UrlStatus::Pending);
        assert_eq!(url.attempts, 0);
        assert_eq!(url.error_message, None);
    }
}
