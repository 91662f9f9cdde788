//! Decrypted session material handed to the scraper.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use thiserror::Error;

use crate::db::{account_repo, Database, DatabaseError};
use crate::secrets::{CookieCipher, SecretError};

/// Session of one account, ready for the scraper.
#[derive(Debug)]
pub struct AccountCredentials {
    pub account_id: String,
    pub email: Option<String>,
    /// Cookie JSON as stored by the browser extension.
    pub cookies: SecretString,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Looks up the session of an account.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, account_id: &str) -> Result<AccountCredentials, CredentialError>;
}

/// Reads encrypted cookies from the `accounts` table.
pub struct DbCredentialStore {
    db: Database,
    cipher: Arc<CookieCipher>,
}

impl DbCredentialStore {
    pub fn new(db: Database, cipher: Arc<CookieCipher>) -> Self {
        Self { db, cipher }
    }

    /// Encrypts cookie JSON for storage.
    pub fn seal(&self, cookies_json: &str) -> Result<String, SecretError> {
        self.cipher.encrypt(cookies_json)
    }

    /// Stores fresh cookies; the account goes back to `pending` until a
    /// scrape succeeds with them.
    pub fn replace_cookies(
        &self,
        account_id: &str,
        cookies_json: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        let sealed = self.seal(cookies_json)?;
        if account_repo::update_cookies(&self.db, account_id, &sealed, now)? {
            log::info!("Cookies refreshed for account {}", account_id);
            Ok(())
        } else {
            Err(CredentialError::AccountNotFound(account_id.to_string()))
        }
    }
}

#[async_trait]
impl CredentialStore for DbCredentialStore {
    async fn credentials(&self, account_id: &str) -> Result<AccountCredentials, CredentialError> {
        let account = account_repo::find_by_id(&self.db, account_id)?
            .ok_or_else(|| CredentialError::AccountNotFound(account_id.to_string()))?;
        let cookies = self.cipher.decrypt(&account.encrypted_cookies)?;
        Ok(AccountCredentials {
            account_id: account.id,
            email: account.email,
            cookies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::model::fixtures::account;
    use crate::accounts::ValidationStatus;
    use secrecy::ExposeSecret;

    fn store() -> DbCredentialStore {
        let key = CookieCipher::generate_key().unwrap();
        DbCredentialStore::new(
            Database::open_in_memory().unwrap(),
            Arc::new(CookieCipher::from_hex_key(&key).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_credentials_roundtrip_through_cipher() {
        let store = store();
        let now = Utc::now();
        let mut acc = account("a1", now);
        acc.encrypted_cookies = store.seal(r#"[{"name":"li_at","value":"abc"}]"#).unwrap();
        account_repo::insert(&store.db, &acc).unwrap();

        let creds = store.credentials("a1").await.unwrap();
        assert_eq!(creds.account_id, "a1");
        assert!(creds.cookies.expose_secret().contains("li_at"));
        assert!(!format!("{:?}", creds).contains("abc"));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let store = store();
        assert!(matches!(
            store.credentials("missing").await,
            Err(CredentialError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_undecryptable_cookies() {
        let store = store();
        let mut acc = account("a1", Utc::now());
        acc.encrypted_cookies = "zz".to_string();
        account_repo::insert(&store.db, &acc).unwrap();
        assert!(matches!(
            store.credentials("a1").await,
            Err(CredentialError::Secret(_))
        ));
    }

    #[test]
    fn test_replace_cookies_resets_to_pending() {
        let store = store();
        let now = Utc::now();
        let mut acc = account("a1", now);
        acc.validation_status = ValidationStatus::Invalid;
        account_repo::insert(&store.db, &acc).unwrap();

        store.replace_cookies("a1", "[]", now).unwrap();
        let stored = account_repo::find_by_id(&store.db, "a1").unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Pending);
        assert!(stored.is_eligible(now));
        assert!(matches!(
            store.replace_cookies("nope", "[]", now),
            Err(CredentialError::AccountNotFound(_))
        ));
    }
}
