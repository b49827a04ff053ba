//! API route definitions
//!
//! [`api_routes`] paths are relative to `/api/v1`; [`refresh_route`] takes the
//! full configured path. Each protected group carries its gate as a route
//! layer; identity resolution itself wraps the whole router in
//! [`crate::create_router`].

use crate::auth::middleware::{require_activated, require_authenticated, require_permission};
use crate::handlers::{tokens, users};
use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

/// Permission required to delete accounts
pub const USERS_WRITE: &str = "users:write";

/// Create API v1 routes
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let public_routes = Router::new()
        .route("/users", post(users::register_user))
        .route("/users/activated", put(users::activate_user))
        .route(
            "/tokens/authentication",
            post(tokens::create_authentication_token),
        );

    let authenticated_routes = Router::new()
        .route("/me", get(users::me))
        .route_layer(middleware::from_fn(require_authenticated));

    let activated_routes = Router::new()
        .route(
            "/users/:username",
            get(users::get_user).patch(users::update_password),
        )
        .route_layer(middleware::from_fn(require_activated));

    let admin_routes = Router::new()
        .route("/users/:username", delete(users::delete_user))
        .route_layer(middleware::from_fn(require_permission(state, USERS_WRITE)));

    Router::new()
        .merge(public_routes)
        .merge(authenticated_routes)
        .merge(activated_routes)
        .merge(admin_routes)
}

/// Refresh route, mounted at the full configured refresh path
///
/// The gate validates bearer tokens on exactly this path as refresh tokens,
/// so the route and the gate must agree on it.
pub fn refresh_route(refresh_path: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route(refresh_path, post(tokens::refresh_token))
        .route_layer(middleware::from_fn(require_authenticated))
}
