//! Request authentication and the authorization gate chain
//!
//! [`authenticate`] runs on every request. It turns the `Authorization`
//! header into an [`Identity`] and stores it in the request extensions:
//!
//! - no header: `Identity::Anonymous`
//! - `Bearer <token>` on the refresh route: the token must be a refresh token
//!   whose binding key still matches the account's revocation secret
//! - `Bearer <token>` anywhere else: the token must be an access token
//!
//! The gates then narrow access in a fixed chain:
//! `require_permission` ⊃ `require_activated` ⊃ `require_authenticated`.

use super::token::{TokenError, TokenKind, TokenService};
use crate::audit::{audit_log, extract_ip_address, extract_user_agent, AuditEvent};
use crate::state::{AppState, AuthOutcome};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use capybook_core::{Account, AccountStore, AuthConfig, Permissions, StoreError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Who is making the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Resolved(Account),
}

impl Identity {
    pub fn account(&self) -> Option<&Account> {
        match self {
            Identity::Anonymous => None,
            Identity::Resolved(account) => Some(account),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

/// Authentication and authorization failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or missing authentication token")]
    MalformedCredential,

    #[error("invalid or missing authentication token")]
    InvalidToken,

    /// Reported to the client exactly like `InvalidToken`
    #[error("invalid or missing authentication token")]
    RevokedToken { username: String },

    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,

    #[error("your user account must be activated to access this resource")]
    InactiveAccount,

    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted,

    #[error("token subject has no matching account")]
    AccountNotFound,

    #[error("account lookup timed out")]
    LookupTimeout,

    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

impl From<TokenError> for AuthError {
    fn from(_: TokenError) -> Self {
        AuthError::InvalidToken
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MalformedCredential
            | AuthError::InvalidToken
            | AuthError::RevokedToken { .. }
            | AuthError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            AuthError::InactiveAccount | AuthError::NotPermitted => StatusCode::FORBIDDEN,
            AuthError::AccountNotFound | AuthError::LookupTimeout | AuthError::Store(_) => {
                tracing::error!(error = %self, "authentication backend failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "the server encountered a problem and could not process your request".to_string()
        } else {
            self.to_string()
        };

        let body = axum::Json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Resolves bearer tokens to accounts
#[derive(Clone)]
pub struct AuthGate {
    tokens: TokenService,
    store: Arc<dyn AccountStore>,
    refresh_path: String,
    lookup_timeout: Duration,
}

impl AuthGate {
    pub fn new(tokens: TokenService, store: Arc<dyn AccountStore>, config: &AuthConfig) -> Self {
        Self {
            tokens,
            store,
            refresh_path: config.refresh_path.clone(),
            lookup_timeout: config.lookup_timeout(),
        }
    }

    /// Kind of bearer token accepted on `path`
    pub fn token_kind_for(&self, path: &str) -> TokenKind {
        if path == self.refresh_path {
            TokenKind::Refresh
        } else {
            TokenKind::Access
        }
    }

    /// Resolve the identity behind a request's headers
    pub async fn resolve(&self, headers: &HeaderMap, path: &str) -> Result<Identity, AuthError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(Identity::Anonymous);
        };
        let token = bearer_token(value)?;

        let account = match self.token_kind_for(path) {
            TokenKind::Refresh => self.resolve_refresh(token).await?,
            TokenKind::Access => self.resolve_access(token).await?,
        };

        Ok(Identity::Resolved(account))
    }

    async fn resolve_access(&self, token: &str) -> Result<Account, AuthError> {
        let claims = self.tokens.validate_access_token(token)?;
        self.lookup(&claims.sub).await
    }

    async fn resolve_refresh(&self, token: &str) -> Result<Account, AuthError> {
        let claims = self.tokens.validate_refresh_token(token)?;
        let account = self.lookup(&claims.sub).await?;

        if !TokenService::binding_key_matches(
            &account.username,
            &account.token_hash,
            &claims.binding_key,
        ) {
            return Err(AuthError::RevokedToken {
                username: account.username,
            });
        }

        Ok(account)
    }

    async fn lookup(&self, username: &str) -> Result<Account, AuthError> {
        tokio::time::timeout(self.lookup_timeout, self.store.get_by_username(username))
            .await
            .map_err(|_| AuthError::LookupTimeout)?
            .map_err(|e| match e {
                StoreError::NotFound => AuthError::AccountNotFound,
                other => AuthError::Store(other),
            })
    }

    /// Load an account's permission codes, bounded by the lookup timeout
    pub async fn permissions(&self, account: &Account) -> Result<Permissions, AuthError> {
        Ok(
            tokio::time::timeout(self.lookup_timeout, self.store.permissions_for(account.id))
                .await
                .map_err(|_| AuthError::LookupTimeout)??,
        )
    }
}

/// Split `Bearer <token>` into its token part
fn bearer_token(value: &HeaderValue) -> Result<&str, AuthError> {
    let value = value.to_str().map_err(|_| AuthError::MalformedCredential)?;
    match value.split(' ').collect::<Vec<_>>().as_slice() {
        ["Bearer", token] => Ok(*token),
        _ => Err(AuthError::MalformedCredential),
    }
}

/// Attach an [`Identity`] to every request
///
/// Resolved identities also carry the [`TokenKind`] they were resolved from.
/// Must wrap the whole router so that the refresh route is recognised by
/// its full path.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let mut response = match state.gate.resolve(request.headers(), &path).await {
        Ok(identity) => {
            if identity.is_anonymous() {
                state.record_auth_outcome(AuthOutcome::Anonymous);
            } else {
                state.record_auth_outcome(AuthOutcome::Resolved);
                request
                    .extensions_mut()
                    .insert(state.gate.token_kind_for(&path));
            }
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            state.record_auth_outcome(AuthOutcome::Rejected);
            audit_rejection(request.headers(), &err);
            err.into_response()
        }
    };

    response
        .headers_mut()
        .append(header::VARY, HeaderValue::from_static("Authorization"));
    response
}

fn audit_rejection(headers: &HeaderMap, err: &AuthError) {
    let ip_address = extract_ip_address(headers);
    let user_agent = extract_user_agent(headers);

    match err {
        AuthError::RevokedToken { username } => audit_log(&AuditEvent::RevokedRefreshToken {
            username: username.clone(),
            ip_address,
            user_agent,
        }),
        AuthError::MalformedCredential | AuthError::InvalidToken => {
            audit_log(&AuditEvent::InvalidToken {
                ip_address,
                user_agent,
                reason: match err {
                    AuthError::MalformedCredential => "malformed authorization header",
                    _ => "token failed validation",
                }
                .to_string(),
            })
        }
        _ => {}
    }
}

/// Reject anonymous callers
pub fn check_authenticated(identity: &Identity) -> Result<&Account, AuthError> {
    identity.account().ok_or(AuthError::AuthenticationRequired)
}

/// Reject anonymous callers and inactive accounts
pub fn check_activated(identity: &Identity) -> Result<&Account, AuthError> {
    let account = check_authenticated(identity)?;
    if !account.activated {
        return Err(AuthError::InactiveAccount);
    }
    Ok(account)
}

/// Reject callers that are not activated or lack `code`
pub async fn check_permission<'a>(
    gate: &AuthGate,
    identity: &'a Identity,
    code: &str,
) -> Result<&'a Account, AuthError> {
    let account = check_activated(identity)?;
    if !gate.permissions(account).await?.includes(code) {
        return Err(AuthError::NotPermitted);
    }
    Ok(account)
}

fn identity_of(request: &Request<Body>) -> Identity {
    request
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or(Identity::Anonymous)
}

fn audit_denied(request: &Request<Body>, identity: &Identity, required_permission: Option<&str>) {
    let account = identity.account();
    audit_log(&AuditEvent::AccessDenied {
        account_id: account.map(|a| a.id),
        username: account.map(|a| a.username.clone()),
        resource: request.uri().path().to_string(),
        required_permission: required_permission.map(str::to_string),
        ip_address: extract_ip_address(request.headers()),
        user_agent: extract_user_agent(request.headers()),
    });
}

/// Gate: the caller must be a resolved account
///
/// ```ignore
/// Router::new()
///     .route("/api/v1/me", get(me))
///     .route_layer(middleware::from_fn(require_authenticated));
/// ```
pub async fn require_authenticated(
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let identity = identity_of(&request);
    if let Err(err) = check_authenticated(&identity) {
        audit_denied(&request, &identity, None);
        return Err(err);
    }
    Ok(next.run(request).await)
}

/// Gate: the caller must be a resolved, activated account
pub async fn require_activated(request: Request<Body>, next: Next) -> Result<Response, AuthError> {
    let identity = identity_of(&request);
    if let Err(err) = check_activated(&identity) {
        audit_denied(&request, &identity, None);
        return Err(err);
    }
    Ok(next.run(request).await)
}

type GateFuture = Pin<Box<dyn Future<Output = Result<Response, AuthError>> + Send>>;

/// Gate factory: the caller must be activated and hold permission `code`
///
/// # Example
///
/// ```ignore
/// Router::new()
///     .route("/api/v1/users/:username", delete(delete_user))
///     .route_layer(middleware::from_fn(require_permission(state.clone(), "users:write")));
/// ```
pub fn require_permission(
    state: Arc<AppState>,
    code: &'static str,
) -> impl Fn(Request<Body>, Next) -> GateFuture + Clone {
    move |request: Request<Body>, next: Next| -> GateFuture {
        let state = state.clone();
        Box::pin(async move {
            let identity = identity_of(&request);
            if let Err(err) = check_permission(&state.gate, &identity, code).await {
                if matches!(
                    err,
                    AuthError::AuthenticationRequired
                        | AuthError::InactiveAccount
                        | AuthError::NotPermitted
                ) {
                    audit_denied(&request, &identity, Some(code));
                }
                return Err(err);
            }
            Ok(next.run(request).await)
        })
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Identity>()
            .cloned()
            .unwrap_or(Identity::Anonymous))
    }
}

/// Extractor for handlers that need the caller's account
pub struct CurrentAccount(pub Account);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentAccount {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Identity>() {
            Some(Identity::Resolved(account)) => Ok(CurrentAccount(account.clone())),
            _ => Err(AuthError::AuthenticationRequired),
        }
    }
}

/// Extractor for the refresh flow: the caller's account, resolved from a
/// refresh token whose binding key matched
pub struct RefreshAccount(pub Account);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RefreshAccount {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match (
            parts.extensions.get::<Identity>(),
            parts.extensions.get::<TokenKind>(),
        ) {
            (Some(Identity::Resolved(account)), Some(TokenKind::Refresh)) => {
                Ok(RefreshAccount(account.clone()))
            }
            (Some(Identity::Resolved(_)), _) => Err(AuthError::InvalidToken),
            _ => Err(AuthError::AuthenticationRequired),
        }
    }
}
