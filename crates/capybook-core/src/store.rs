//! Record store boundary
//!
//! The auth layer reaches accounts, permissions and activation codes only
//! through [`AccountStore`]. Two implementations ship with the crate:
//! [`crate::memory::MemoryStore`] for development and tests, and
//! [`crate::postgres::PgStore`] for deployments.

use crate::account::{Account, NewAccount, Permissions, Verification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Record store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate username")]
    DuplicateUsername,

    #[error("duplicate email")]
    DuplicateEmail,

    #[error("edit conflict")]
    EditConflict,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => match db_err.constraint() {
                Some("users_username_key") => StoreError::DuplicateUsername,
                Some("users_email_key") => StoreError::DuplicateEmail,
                _ => StoreError::Database(db_err.to_string()),
            },
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Persistence operations for accounts and their satellite records
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an account by its unique username
    async fn get_by_username(&self, username: &str) -> Result<Account, StoreError>;

    /// Fetch an account by its unique email address
    async fn get_by_email(&self, email: &str) -> Result<Account, StoreError>;

    /// Insert a new account and return it with its assigned id
    async fn insert(&self, account: NewAccount) -> Result<Account, StoreError>;

    /// Persist every mutable field of an existing account
    async fn update(&self, account: &Account) -> Result<(), StoreError>;

    /// Delete an account by username
    async fn delete(&self, username: &str) -> Result<(), StoreError>;

    /// Load the permission codes granted to an account
    async fn permissions_for(&self, account_id: i64) -> Result<Permissions, StoreError>;

    /// Grant permission codes to an account; already granted codes are ignored
    async fn add_permissions(&self, account_id: i64, codes: &[&str]) -> Result<(), StoreError>;

    /// Store a new activation code
    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError>;

    /// Find the account owning an unexpired activation code
    async fn get_by_verification_code(
        &self,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError>;

    /// Remove every activation code belonging to an account
    async fn delete_verifications(&self, account_id: i64) -> Result<(), StoreError>;
}
