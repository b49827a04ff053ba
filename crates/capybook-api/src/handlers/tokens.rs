//! Token endpoints
//!
//! Credential exchange and refresh. The refresh route is the one path on
//! which the bearer token must be a refresh token; the gate has already
//! checked its binding key by the time the handler runs.

use crate::audit::ClientInfo;
use crate::auth::middleware::RefreshAccount;
use crate::auth::service::{AccessTokenResponse, LoginRequest, TokenPair};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

/// Exchange credentials for an access and refresh token pair
///
/// Looks the account up by `email` when a valid address is supplied,
/// otherwise by `username`.
#[utoipa::path(
    post,
    path = "/api/v1/tokens/authentication",
    tag = "tokens",
    request_body = LoginRequest,
    responses(
        (status = 201, description = "Tokens issued", body = TokenPair),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
        (status = 422, description = "Invalid input", body = crate::error::ApiError),
    )
)]
pub async fn create_authentication_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let pair = state
        .auth
        .create_tokens(request, &ClientInfo::from_headers(&headers))
        .await?;

    Ok((StatusCode::CREATED, Json(pair)))
}

/// Mint a new access token from a live refresh token
///
/// Mounted at the configured refresh path, `/api/v1/token/refresh` by default.
#[utoipa::path(
    post,
    path = "/api/v1/token/refresh",
    tag = "tokens",
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Access token issued", body = AccessTokenResponse),
        (status = 401, description = "Missing, invalid or revoked refresh token"),
    )
)]
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RefreshAccount(account): RefreshAccount,
) -> Result<impl IntoResponse, AppError> {
    let response = state
        .auth
        .refresh(&account, &ClientInfo::from_headers(&headers))?;

    Ok((StatusCode::CREATED, Json(response)))
}
