//! Scrape jobs and their URLs.

pub mod model;
pub mod service;

pub use model::{Job, JobAccountAssignment, JobKind, JobStatus, JobUrl, UrlStatus};
pub use service::{JobError, JobService, NewJob};
