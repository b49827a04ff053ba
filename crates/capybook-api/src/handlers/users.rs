//! Account endpoints
//!
//! Registration and activation are public. The remaining routes sit behind
//! the gate chain configured in [`crate::routes`].

use crate::audit::ClientInfo;
use crate::auth::middleware::CurrentAccount;
use crate::auth::service::{AccountView, ActivateRequest, ChangePasswordRequest, RegisterRequest};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

/// Register a new account
///
/// The account starts inactive. An activation code is mailed to the given
/// address in the background.
#[utoipa::path(
    post,
    path = "/api/v1/users",
    tag = "users",
    request_body = RegisterRequest,
    responses(
        (status = 202, description = "Account created, activation pending", body = AccountView),
        (status = 422, description = "Invalid input or duplicate username/email", body = crate::error::ApiError),
    )
)]
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .auth
        .register(request, &ClientInfo::from_headers(&headers))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(view)))
}

#[utoipa::path(
    put,
    path = "/api/v1/users/activated",
    tag = "users",
    request_body = ActivateRequest,
    responses(
        (status = 200, description = "Account activated", body = AccountView),
        (status = 422, description = "Invalid or expired code", body = crate::error::ApiError),
    )
)]
pub async fn activate_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<AccountView>, AppError> {
    Ok(Json(state.auth.activate(request).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{username}",
    tag = "users",
    security(("bearer" = [])),
    params(("username" = String, Path, description = "Account username")),
    responses(
        (status = 200, description = "Account found", body = AccountView),
        (status = 404, description = "No such account", body = crate::error::ApiError),
    )
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<AccountView>, AppError> {
    Ok(Json(state.auth.get_user(&username).await?))
}

/// Change the caller's own password
///
/// Rotates the account's revocation secret, so every refresh token issued
/// before this call stops working.
#[utoipa::path(
    patch,
    path = "/api/v1/users/{username}",
    tag = "users",
    security(("bearer" = [])),
    params(("username" = String, Path, description = "Account username")),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = AccountView),
        (status = 403, description = "Not the caller's account", body = crate::error::ApiError),
        (status = 422, description = "Invalid password", body = crate::error::ApiError),
    )
)]
pub async fn update_password(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    CurrentAccount(caller): CurrentAccount,
    Path(username): Path<String>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AccountView>, AppError> {
    let view = state
        .auth
        .change_password(&caller, &username, request, &ClientInfo::from_headers(&headers))
        .await?;

    Ok(Json(view))
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{username}",
    tag = "users",
    security(("bearer" = [])),
    params(("username" = String, Path, description = "Account username")),
    responses(
        (status = 204, description = "Account deleted"),
        (status = 403, description = "Missing users:write permission"),
        (status = 404, description = "No such account", body = crate::error::ApiError),
    )
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    CurrentAccount(caller): CurrentAccount,
    Path(username): Path<String>,
) -> Result<StatusCode, AppError> {
    state.auth.delete_user(&caller, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The caller's own account
#[utoipa::path(
    get,
    path = "/api/v1/me",
    tag = "users",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Caller's account", body = AccountView),
        (status = 401, description = "Not authenticated"),
    )
)]
pub async fn me(CurrentAccount(account): CurrentAccount) -> Json<AccountView> {
    Json(AccountView::from(&account))
}
