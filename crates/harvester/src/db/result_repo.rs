//! Result repository for `profile_results` and `company_results`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{format_timestamp, get_timestamp, Database, DatabaseError};
use crate::results::ScrapeRecord;
use crate::scraper::ScrapeKind;

/// A result row ready for insertion.
#[derive(Debug, Clone)]
pub struct NewResult<'a> {
    pub id: &'a str,
    pub job_id: &'a str,
    pub job_url_id: Option<&'a str>,
    pub source_url: &'a str,
    pub record: &'a ScrapeRecord,
    /// JSON of the whole record.
    pub data: &'a str,
    pub raw_payload: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// A stored result of either kind.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub id: String,
    pub kind: ScrapeKind,
    pub job_id: String,
    pub job_url_id: Option<String>,
    pub source_url: String,
    /// Profile full name or company name.
    pub title: Option<String>,
    pub data: String,
    pub raw_payload: Option<String>,
    pub content_valid: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredResult {
    fn from_row(row: &Row<'_>, kind: ScrapeKind) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind,
            job_id: row.get("job_id")?,
            job_url_id: row.get("job_url_id")?,
            source_url: row.get("source_url")?,
            title: row.get("title")?,
            data: row.get("data")?,
            raw_payload: row.get("raw_payload")?,
            content_valid: row.get("content_valid")?,
            created_at: get_timestamp(row, "created_at")?,
        })
    }
}

pub(crate) fn insert_in(conn: &Connection, result: &NewResult<'_>) -> Result<(), DatabaseError> {
    let created_at = format_timestamp(result.created_at);
    let content_valid = result.record.is_content_valid();
    match result.record {
        ScrapeRecord::Profile(p) => {
            conn.execute(
                "INSERT INTO profile_results (id, job_id, job_url_id, source_url, full_name,
                 headline, location, about, current_company, data, raw_payload, content_valid,
                 created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    result.id,
                    result.job_id,
                    result.job_url_id,
                    result.source_url,
                    p.full_name,
                    p.headline,
                    p.location,
                    p.about,
                    p.current_company,
                    result.data,
                    result.raw_payload,
                    content_valid,
                    created_at,
                ],
            )?;
        }
        ScrapeRecord::Company(c) => {
            conn.execute(
                "INSERT INTO company_results (id, job_id, job_url_id, source_url, name, industry,
                 company_size, headquarters, website, description, data, raw_payload,
                 content_valid, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    result.id,
                    result.job_id,
                    result.job_url_id,
                    result.source_url,
                    c.name,
                    c.industry,
                    c.company_size,
                    c.headquarters,
                    c.website,
                    c.description,
                    result.data,
                    result.raw_payload,
                    content_valid,
                    created_at,
                ],
            )?;
        }
    }
    Ok(())
}

/// Lists the results of a job of the given kind, oldest first.
pub fn list_by_job(
    db: &Database,
    job_id: &str,
    kind: ScrapeKind,
) -> Result<Vec<StoredResult>, DatabaseError> {
    let sql = match kind {
        ScrapeKind::Profile => {
            "SELECT id, job_id, job_url_id, source_url, full_name AS title, data, raw_payload,
             content_valid, created_at FROM profile_results WHERE job_id = ?1
             ORDER BY created_at ASC, id ASC"
        }
        ScrapeKind::Company => {
            "SELECT id, job_id, job_url_id, source_url, name AS title, data, raw_payload,
             content_valid, created_at FROM company_results WHERE job_id = ?1
             ORDER BY created_at ASC, id ASC"
        }
    };
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![job_id], |row| StoredResult::from_row(row, kind))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts results of both kinds belonging to a job.
pub fn count_by_job(db: &Database, job_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM profile_results WHERE job_id = ?1)
             + (SELECT COUNT(*) FROM company_results WHERE job_id = ?1)",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
