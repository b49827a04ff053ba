//! Capybook API - bearer token service
//!
//! Issues access and refresh tokens, resolves them on every request and
//! enforces the authenticated / activated / permission gate chain.

pub mod audit;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod middleware;
pub mod routes;
pub mod state;

use crate::auth::middleware::authenticate;
use crate::auth::password::PasswordConfig;
use crate::auth::service::AuthService;
use crate::auth::token::{SigningKey, TokenService};
use crate::handlers::health;
use crate::mailer::{LogMailer, Mailer};
use crate::state::AppState;
use axum::{http::HeaderValue, middleware::from_fn_with_state, routing::get, Router};
use capybook_core::{AccountStore, AppConfig, MemoryStore};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::health::prometheus_metrics,
        handlers::users::register_user,
        handlers::users::activate_user,
        handlers::users::get_user,
        handlers::users::update_password,
        handlers::users::delete_user,
        handlers::users::me,
        handlers::tokens::create_authentication_token,
        handlers::tokens::refresh_token,
    ),
    components(schemas(
        error::ApiError,
        handlers::health::HealthResponse,
        auth::service::RegisterRequest,
        auth::service::ActivateRequest,
        auth::service::LoginRequest,
        auth::service::ChangePasswordRequest,
        auth::service::TokenPair,
        auth::service::AccessTokenResponse,
        auth::service::AccountView,
    )),
    modifiers(&BearerSecurity),
    tags(
        (name = "users", description = "Account registration and management"),
        (name = "tokens", description = "Token issuance and refresh"),
        (name = "health", description = "Liveness and metrics"),
    )
)]
pub struct ApiDoc;

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::prometheus_metrics))
        .nest("/api/v1", routes::api_routes(state.clone()))
        .merge(routes::refresh_route(&state.config.auth.refresh_path))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // outer layers run first: metrics sees every request, including rejected ones
        .layer(from_fn_with_state(state.clone(), authenticate))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// HS256 state over an in-memory store, with cheap password hashing
pub fn create_test_state(mailer: Arc<dyn Mailer>) -> Arc<AppState> {
    create_test_state_with_config(AppConfig::default(), mailer)
}

/// [`create_test_state`] over a caller-supplied configuration; the signing
/// key is always the fixed test secret
pub fn create_test_state_with_config(config: AppConfig, mailer: Arc<dyn Mailer>) -> Arc<AppState> {
    let store: Arc<dyn AccountStore> = Arc::new(MemoryStore::new());
    let tokens = TokenService::new(
        SigningKey::Hmac(b"capybook-test-signing-secret".to_vec()),
        config.auth.issuer.clone(),
        std::time::Duration::from_secs(config.auth.access_ttl_secs),
    )
    .expect("static test key is valid");

    let auth = AuthService::new(store.clone(), tokens.clone(), mailer.clone(), &config.auth)
        .with_password_config(PasswordConfig::light());

    Arc::new(AppState::new(config, tokens, store, mailer).with_auth_service(auth))
}

/// Router over [`create_test_state`] with a logging mailer
pub fn create_router_for_testing() -> Router {
    create_router(create_test_state(Arc::new(LogMailer)))
}
