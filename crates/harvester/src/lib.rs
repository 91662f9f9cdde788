pub mod accounts;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod results;
pub mod retry;
pub mod sanitize;
pub mod scheduler;
pub mod scraper;
pub mod secrets;

pub use accounts::{
    Account, AccountHealthStore, AccountRotator, CredentialStore, DbCredentialStore, HealthPolicy,
    RotationError, RotationPolicy,
};
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use clock::{Clock, InstantClock, SystemClock};
pub use config::{load_config, Config};
pub use db::Database;
pub use dispatch::{DispatchSettings, JobControl, JobOutcome, UrlDispatcher};
pub use error::{ConfigError, HarvesterError, Result};
pub use jobs::{Job, JobKind, JobService, JobStatus, NewJob};
pub use results::{ResultSink, ScrapeRecord};
pub use retry::RetryPolicy;
pub use scheduler::{QueueStatus, Scheduler, SchedulerSettings};
pub use scraper::{ScrapeFailure, ScrapeKind, ScrapeSuccess, Scraper};
pub use secrets::{resolve_secret, CookieCipher, SecretError};
