//! Scraped records and their persistence.

pub mod model;
pub mod sink;

pub use model::{CompanyRecord, ProfileRecord, ScrapeRecord};
pub use sink::{FallbackJob, ResultSink, SaveTarget, SinkError};
