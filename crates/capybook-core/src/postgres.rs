//! PostgreSQL record store
//!
//! Account, permission and activation-code tables accessed with SQLx.

use crate::account::{Account, NewAccount, Permissions, Verification};
use crate::store::{AccountStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;

/// Schema applied by [`PgStore::migrate`]
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id bigserial PRIMARY KEY,
    created_at timestamptz NOT NULL DEFAULT now(),
    username text NOT NULL,
    email text NOT NULL,
    password_hash text NOT NULL,
    token_hash text NOT NULL,
    activated boolean NOT NULL DEFAULT false,
    CONSTRAINT users_username_key UNIQUE (username),
    CONSTRAINT users_email_key UNIQUE (email)
);

CREATE TABLE IF NOT EXISTS permissions (
    id bigserial PRIMARY KEY,
    code text NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS users_permissions (
    user_id bigint NOT NULL REFERENCES users ON DELETE CASCADE,
    permission_id bigint NOT NULL REFERENCES permissions ON DELETE CASCADE,
    PRIMARY KEY (user_id, permission_id)
);

CREATE TABLE IF NOT EXISTS verifications (
    code bytea PRIMARY KEY,
    user_id bigint NOT NULL REFERENCES users ON DELETE CASCADE,
    expiry timestamptz NOT NULL
);
"#;

const ACCOUNT_COLUMNS: &str =
    "users.id, users.username, users.email, users.password_hash, users.token_hash, users.activated, users.created_at";

/// PostgreSQL-backed record store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("PostgreSQL connection failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create the tables if they do not exist yet
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_one_account(
        &self,
        filter: &str,
        value: &str,
    ) -> Result<Account, StoreError> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE {filter} = $1");
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        Ok(row.into())
    }
}

/// Account row from database
#[derive(Debug, FromRow)]
struct AccountRow {
    id: i64,
    username: String,
    email: String,
    password_hash: String,
    token_hash: String,
    activated: bool,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            token_hash: row.token_hash,
            activated: row.activated,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_by_username(&self, username: &str) -> Result<Account, StoreError> {
        self.fetch_one_account("username", username).await
    }

    async fn get_by_email(&self, email: &str) -> Result<Account, StoreError> {
        self.fetch_one_account("email", email).await
    }

    async fn insert(&self, account: NewAccount) -> Result<Account, StoreError> {
        let query = format!(
            "INSERT INTO users (username, email, password_hash, token_hash, activated) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(&account.username)
            .bind(&account.email)
            .bind(&account.password_hash)
            .bind(&account.token_hash)
            .bind(account.activated)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn update(&self, account: &Account) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET username = $1, email = $2, password_hash = $3, token_hash = $4, activated = $5 \
             WHERE id = $6",
        )
        .bind(&account.username)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(&account.token_hash)
        .bind(account.activated)
        .bind(account.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::EditConflict);
        }
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn permissions_for(&self, account_id: i64) -> Result<Permissions, StoreError> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT permissions.code FROM permissions \
             INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id \
             WHERE users_permissions.user_id = $1",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(codes.into_iter().collect())
    }

    async fn add_permissions(&self, account_id: i64, codes: &[&str]) -> Result<(), StoreError> {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO permissions (code) SELECT UNNEST($1::text[]) ON CONFLICT (code) DO NOTHING")
            .bind(&codes)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO users_permissions (user_id, permission_id) \
             SELECT $1, permissions.id FROM permissions WHERE permissions.code = ANY($2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(account_id)
        .bind(&codes)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO verifications (code, user_id, expiry) VALUES ($1, $2, $3)")
            .bind(&verification.code_hash)
            .bind(verification.account_id)
            .bind(verification.expiry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_verification_code(
        &self,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users \
             INNER JOIN verifications ON users.id = verifications.user_id \
             WHERE verifications.code = $1 AND verifications.expiry > $2"
        );
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(code_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        Ok(row.into())
    }

    async fn delete_verifications(&self, account_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM verifications WHERE user_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
