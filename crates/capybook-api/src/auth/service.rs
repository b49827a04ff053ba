//! Account and credential service
//!
//! Business logic behind the user and token endpoints: registration,
//! activation, credential exchange, refresh, password change and account
//! removal. Every record store call is bounded by the configured lookup
//! timeout.

use super::password::{
    hash_password_with_config, validate_password_length, verify_password, PasswordConfig,
    PasswordError,
};
use super::token::TokenService;
use crate::audit::{audit_log, AuditEvent, ClientInfo};
use crate::error::AppError;
use crate::mailer::{dispatch, MailMessage, Mailer};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use capybook_core::{Account, AccountStore, AuthConfig, NewAccount, StoreError, Verification};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

/// Permission granted to every new account
pub const DEFAULT_PERMISSION: &str = "books:read";

/// Length of a plaintext activation code (16 bytes, base64url without padding)
pub const ACTIVATION_CODE_LEN: usize = 22;

const INVALID_CREDENTIALS: &str = "invalid authentication credentials";

/// User registration request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 32, message = "must be between 3 and 32 characters"))]
    pub username: String,
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    pub password: String,
}

/// Account activation request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ActivateRequest {
    #[validate(length(equal = 22, message = "must be 22 characters long"))]
    pub code: String,
}

/// Credential exchange request; `email` wins over `username` when both are set
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: String,
}

/// Password change request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub password: String,
}

/// Token pair returned by the credential exchange
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Access token returned by the refresh endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

/// Public view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AccountView {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub activated: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            username: account.username.clone(),
            email: account.email.clone(),
            activated: account.activated,
            created_at: account.created_at,
        }
    }
}

/// Account and credential service
#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn AccountStore>,
    tokens: TokenService,
    mailer: Arc<dyn Mailer>,
    lookup_timeout: Duration,
    revocation_secret_len: usize,
    verification_ttl: chrono::Duration,
    password: PasswordConfig,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        tokens: TokenService,
        mailer: Arc<dyn Mailer>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            mailer,
            lookup_timeout: config.lookup_timeout(),
            revocation_secret_len: config.revocation_secret_len,
            verification_ttl: chrono::Duration::hours(config.verification_ttl_hours),
            password: PasswordConfig::default(),
        }
    }

    /// Override the Argon2 cost parameters
    pub fn with_password_config(mut self, password: PasswordConfig) -> Self {
        self.password = password;
        self
    }

    /// Register a new, inactive account
    ///
    /// # Returns
    ///
    /// * `Ok(AccountView)` - The created account
    /// * `Err(AppError::Validation)` - Invalid input or duplicate username/email
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: &ClientInfo,
    ) -> Result<AccountView, AppError> {
        let mut fields = request.validate().err().map(field_errors).unwrap_or_default();
        if !is_valid_username(&request.username) {
            fields
                .entry("username".to_string())
                .or_insert_with(|| "must contain only letters, digits and underscores".to_string());
        }
        if let Err(e) = validate_password_length(&request.password) {
            fields.insert("password".to_string(), e.to_string());
        }
        if !fields.is_empty() {
            return Err(AppError::Validation(fields));
        }

        let password_hash = self.hash(request.password).await?;
        let inserted = self
            .timed(self.store.insert(NewAccount {
                username: request.username.clone(),
                email: request.email,
                password_hash,
                token_hash: TokenService::generate_revocation_secret(self.revocation_secret_len),
                activated: false,
            }))
            .await;

        let account = match inserted {
            Ok(account) => account,
            Err(e) => {
                let err = match e {
                    StoreError::DuplicateUsername => {
                        AppError::field("username", "a user with this username already exists")
                    }
                    StoreError::DuplicateEmail => {
                        AppError::field("email", "a user with this email address already exists")
                    }
                    other => internal(other),
                };
                audit_log(&AuditEvent::RegistrationFailure {
                    username: request.username,
                    reason: format!("{err:?}"),
                    ip_address: client.ip_address.clone(),
                });
                return Err(err);
            }
        };

        self.timed(self.store.add_permissions(account.id, &[DEFAULT_PERMISSION]))
            .await
            .map_err(internal)?;

        let (code, code_hash) = generate_activation_code();
        self.timed(self.store.insert_verification(&Verification {
            code_hash,
            account_id: account.id,
            expiry: Utc::now() + self.verification_ttl,
        }))
        .await
        .map_err(internal)?;

        dispatch(
            self.mailer.clone(),
            MailMessage::welcome(&account.email, &account.username, &code),
        );

        audit_log(&AuditEvent::RegistrationSuccess {
            account_id: account.id,
            username: account.username.clone(),
            ip_address: client.ip_address.clone(),
        });

        Ok(AccountView::from(&account))
    }

    /// Activate the account owning an unexpired activation code
    pub async fn activate(&self, request: ActivateRequest) -> Result<AccountView, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(field_errors(e)))?;

        let lookup = self
            .timed(
                self.store
                    .get_by_verification_code(&hash_code(&request.code), Utc::now()),
            )
            .await;
        let mut account = match lookup {
            Ok(account) => account,
            Err(StoreError::NotFound) => {
                return Err(AppError::field("code", "invalid or expired activation code"))
            }
            Err(e) => return Err(internal(e)),
        };

        account.activated = true;
        self.timed(self.store.update(&account))
            .await
            .map_err(update_error)?;
        self.timed(self.store.delete_verifications(account.id))
            .await
            .map_err(internal)?;

        audit_log(&AuditEvent::AccountActivated {
            account_id: account.id,
            username: account.username.clone(),
        });

        Ok(AccountView::from(&account))
    }

    /// Exchange credentials for an access and refresh token pair
    pub async fn create_tokens(
        &self,
        request: LoginRequest,
        client: &ClientInfo,
    ) -> Result<TokenPair, AppError> {
        if validate_password_length(&request.password).is_err() {
            return Err(AppError::field(
                "password",
                PasswordError::InvalidLength.to_string(),
            ));
        }

        let (identifier, lookup) = match (&request.email, &request.username) {
            (Some(email), _) if email.contains('@') => {
                (email.clone(), self.timed(self.store.get_by_email(email)).await)
            }
            (_, Some(username)) if !username.is_empty() => (
                username.clone(),
                self.timed(self.store.get_by_username(username)).await,
            ),
            _ => {
                return Err(AppError::field(
                    "username",
                    "a username or email address must be provided",
                ))
            }
        };

        let account = match lookup {
            Ok(account) => account,
            Err(StoreError::NotFound) => {
                return Err(self.reject_login(identifier, "unknown account", client))
            }
            Err(e) => return Err(internal(e)),
        };

        if !self.verify(request.password, account.password_hash.clone()).await? {
            return Err(self.reject_login(identifier, "password mismatch", client));
        }

        let pair = TokenPair {
            access_token: self.tokens.issue_access_token(&account).map_err(internal)?,
            refresh_token: self.tokens.issue_refresh_token(&account).map_err(internal)?,
        };

        audit_log(&AuditEvent::LoginSuccess {
            account_id: account.id,
            username: account.username,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });

        Ok(pair)
    }

    /// Mint a fresh access token for an account resolved from a refresh token
    pub fn refresh(
        &self,
        account: &Account,
        client: &ClientInfo,
    ) -> Result<AccessTokenResponse, AppError> {
        let access_token = self.tokens.issue_access_token(account).map_err(internal)?;

        audit_log(&AuditEvent::TokenRefresh {
            account_id: account.id,
            username: account.username.clone(),
            ip_address: client.ip_address.clone(),
        });

        Ok(AccessTokenResponse { access_token })
    }

    pub async fn get_user(&self, username: &str) -> Result<AccountView, AppError> {
        match self.timed(self.store.get_by_username(username)).await {
            Ok(account) => Ok(AccountView::from(&account)),
            Err(StoreError::NotFound) => Err(AppError::NotFound("user".to_string())),
            Err(e) => Err(internal(e)),
        }
    }

    /// Set a new password and rotate the revocation secret
    ///
    /// Every refresh token issued before the change stops validating.
    pub async fn change_password(
        &self,
        caller: &Account,
        username: &str,
        request: ChangePasswordRequest,
        client: &ClientInfo,
    ) -> Result<AccountView, AppError> {
        if caller.username != username {
            return Err(AppError::Forbidden(
                "you can only change your own password".to_string(),
            ));
        }
        if let Err(e) = validate_password_length(&request.password) {
            return Err(AppError::field("password", e.to_string()));
        }

        let mut account = match self.timed(self.store.get_by_username(username)).await {
            Ok(account) => account,
            Err(StoreError::NotFound) => return Err(AppError::NotFound("user".to_string())),
            Err(e) => return Err(internal(e)),
        };

        let password_hash = self.hash(request.password).await?;
        account.change_password(
            password_hash,
            TokenService::generate_revocation_secret(self.revocation_secret_len),
        );
        self.timed(self.store.update(&account))
            .await
            .map_err(update_error)?;

        audit_log(&AuditEvent::PasswordChange {
            account_id: account.id,
            username: account.username.clone(),
            ip_address: client.ip_address.clone(),
        });

        Ok(AccountView::from(&account))
    }

    pub async fn delete_user(&self, caller: &Account, username: &str) -> Result<(), AppError> {
        match self.timed(self.store.delete(username)).await {
            Ok(()) => {
                audit_log(&AuditEvent::AccountDeleted {
                    username: username.to_string(),
                    deleted_by: caller.username.clone(),
                });
                Ok(())
            }
            Err(StoreError::NotFound) => Err(AppError::NotFound("user".to_string())),
            Err(e) => Err(internal(e)),
        }
    }

    fn reject_login(&self, identifier: String, reason: &str, client: &ClientInfo) -> AppError {
        audit_log(&AuditEvent::LoginFailure {
            identifier,
            reason: reason.to_string(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });
        AppError::Unauthorized(INVALID_CREDENTIALS.to_string())
    }

    async fn timed<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.lookup_timeout, operation)
            .await
            .map_err(|_| StoreError::Database("record store timed out".to_string()))?
    }

    async fn hash(&self, password: String) -> Result<String, AppError> {
        let config = self.password.clone();
        tokio::task::spawn_blocking(move || hash_password_with_config(&password, &config))
            .await
            .map_err(internal)?
            .map_err(|e| match e {
                PasswordError::InvalidLength => AppError::field("password", e.to_string()),
                other => internal(other),
            })
    }

    async fn verify(&self, password: String, hash: String) -> Result<bool, AppError> {
        tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(internal)?
            .map_err(internal)
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError::Internal(err.to_string())
}

fn update_error(err: StoreError) -> AppError {
    match err {
        StoreError::EditConflict => AppError::Conflict(
            "unable to update the record due to an edit conflict, please try again".to_string(),
        ),
        other => internal(other),
    }
}

fn field_errors(errors: ValidationErrors) -> BTreeMap<String, String> {
    errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| {
            let message = errs
                .first()
                .and_then(|e| e.message.as_ref())
                .map(|m| m.to_string())
                .unwrap_or_else(|| "is invalid".to_string());
            (field.to_string(), message)
        })
        .collect()
}

fn is_valid_username(username: &str) -> bool {
    username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Plaintext activation code and the SHA-256 hash that gets stored
fn generate_activation_code() -> (String, Vec<u8>) {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let code = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_code(&code);
    (code, hash)
}

fn hash_code(code: &str) -> Vec<u8> {
    Sha256::digest(code.as_bytes()).to_vec()
}
