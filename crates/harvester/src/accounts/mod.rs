//! Scraping accounts: health, selection and credentials.

pub mod credentials;
pub mod health;
pub mod model;
pub mod rotator;

pub use credentials::{AccountCredentials, CredentialError, CredentialStore, DbCredentialStore};
pub use health::{AccountHealthStore, HealthPolicy};
pub use model::{Account, RotationPolicy, ValidationStatus};
pub use rotator::{AccountLease, AccountLeases, AccountRotator, RotationError, SelectionRequest};
