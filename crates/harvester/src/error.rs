use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvesterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("Credential error: {0}")]
    Credential(#[from] crate::accounts::CredentialError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] crate::accounts::RotationError),

    #[error("Job error: {0}")]
    Job(#[from] crate::jobs::JobError),

    #[error("Result sink error: {0}")]
    Sink(#[from] crate::results::SinkError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

pub type Result<T> = std::result::Result<T, HarvesterError>;
