//! API Integration Tests
//!
//! Drive the full router (authentication layer, gates and handlers) against
//! the in-memory store.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use capybook_api::mailer::{MailError, MailMessage, Mailer};
use capybook_api::state::AppState;
use capybook_api::middleware::metrics::UNMATCHED;
use capybook_api::{
    create_router, create_router_for_testing, create_test_state, create_test_state_with_config,
};
use capybook_core::{AccountStore, AppConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const PASSWORD: &str = "pa55word-long";

/// Mailer that keeps every message for inspection
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl RecordingMailer {
    /// Wait for the background welcome mail and pull the activation code out of it
    async fn activation_code_for(&self, recipient: &str) -> String {
        for _ in 0..200 {
            let found = self
                .sent
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.recipient == recipient)
                .cloned();
            if let Some(message) = found {
                let start = message.body.find("\"code\": \"").unwrap() + "\"code\": \"".len();
                return message.body[start..start + 22].to_string();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no mail sent to {recipient}");
    }
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    mailer: Arc<RecordingMailer>,
}

impl TestApp {
    fn new() -> Self {
        let mailer = Arc::new(RecordingMailer::default());
        Self::from_state(create_test_state(mailer.clone()), mailer)
    }

    fn with_config(config: AppConfig) -> Self {
        let mailer = Arc::new(RecordingMailer::default());
        Self::from_state(create_test_state_with_config(config, mailer.clone()), mailer)
    }

    fn from_state(state: Arc<AppState>, mailer: Arc<RecordingMailer>) -> Self {
        Self {
            router: create_router(state.clone()),
            state,
            mailer,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, headers, json)
    }

    async fn register(&self, username: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(create_json_request(
                "POST",
                "/api/v1/users",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": PASSWORD,
                })),
            ))
            .await;
        (status, body)
    }

    async fn activate(&self, username: &str) {
        let code = self
            .mailer
            .activation_code_for(&format!("{username}@example.com"))
            .await;
        let (status, _, body) = self
            .send(create_json_request(
                "PUT",
                "/api/v1/users/activated",
                None,
                Some(json!({ "code": code })),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activated"], true);
    }

    async fn login(&self, username: &str, password: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(create_json_request(
                "POST",
                "/api/v1/tokens/authentication",
                None,
                Some(json!({ "username": username, "password": password })),
            ))
            .await;
        (status, body)
    }

    /// Register, activate and log in; returns (access_token, refresh_token)
    async fn active_user(&self, username: &str) -> (String, String) {
        assert_eq!(self.register(username).await.0, StatusCode::ACCEPTED);
        self.activate(username).await;
        let (status, body) = self.login(username, PASSWORD).await;
        assert_eq!(status, StatusCode::CREATED);
        (
            body["access_token"].as_str().unwrap().to_string(),
            body["refresh_token"].as_str().unwrap().to_string(),
        )
    }
}

/// Helper to create a test request
fn create_json_request(
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    match body {
        Some(json_body) => builder
            .body(Body::from(serde_json::to_string(&json_body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    create_json_request("GET", uri, bearer, None)
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let app = create_router_for_testing();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::new();
    app.send(get("/health", None)).await;

    let response = app
        .router
        .clone()
        .oneshot(get("/metrics", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("capybook_requests_total"));
    assert!(text.contains("capybook_auth_requests_total{outcome=\"anonymous\"}"));
}

#[tokio::test]
async fn test_openapi_document_served() {
    let app = TestApp::new();
    let (status, _, body) = app.send(get("/api-docs/openapi.json", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/v1/token/refresh"].is_object());
}

// =============================================================================
// Identity Resolution Tests
// =============================================================================

#[tokio::test]
async fn test_anonymous_pass_through() {
    let app = TestApp::new();

    let (status, headers, _) = app.send(get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::VARY], "Authorization");

    // only gated routes turn anonymous callers away
    let (status, headers, body) = app.send(get("/api/v1/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
    assert_eq!(
        body["error"],
        "you must be authenticated to access this resource"
    );
}

#[tokio::test]
async fn test_malformed_authorization_header() {
    let app = TestApp::new();

    for value in ["Token abc", "Bearer", "Bearer a b", "bearer abc"] {
        let request = Request::builder()
            .uri("/health")
            .header(header::AUTHORIZATION, value)
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = app.send(request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED, "{value}");
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(headers[header::VARY], "Authorization");
        assert_eq!(body["error"], "invalid or missing authentication token");
    }
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let app = TestApp::new();
    let (status, _, _) = app
        .send(get("/api/v1/me", Some("invalid.token.here")))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_kind_must_match_route() {
    let app = TestApp::new();
    let (access, refresh) = app.active_user("alice").await;

    // refresh token on an ordinary route
    let (status, _, _) = app.send(get("/api/v1/me", Some(&refresh))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // access token on the refresh route
    let (status, _, _) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(&access),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_deleted_account_is_server_error() {
    let app = TestApp::new();
    let (access, _) = app.active_user("alice").await;

    app.state.store.delete("alice").await.unwrap();

    let (status, _, _) = app.send(get("/api/v1/me", Some(&access))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// =============================================================================
// Registration and Activation Tests
// =============================================================================

#[tokio::test]
async fn test_register_and_activate() {
    let app = TestApp::new();

    let (status, body) = app.register("alice").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["activated"], false);
    assert!(body.get("password_hash").is_none());
    assert!(body.get("token_hash").is_none());

    // inactive accounts can log in but not pass the activation gate
    let (status, tokens) = app.login("alice", PASSWORD).await;
    assert_eq!(status, StatusCode::CREATED);
    let access = tokens["access_token"].as_str().unwrap();

    let (status, _, body) = app.send(get("/api/v1/users/alice", Some(access))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "your user account must be activated to access this resource"
    );

    app.activate("alice").await;

    let (status, _, body) = app.send(get("/api/v1/users/alice", Some(access))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activated"], true);
}

#[tokio::test]
async fn test_register_duplicate_username() {
    let app = TestApp::new();
    assert_eq!(app.register("alice").await.0, StatusCode::ACCEPTED);

    let (status, body) = app.register("alice").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["fields"]["username"],
        "a user with this username already exists"
    );
}

#[tokio::test]
async fn test_register_invalid_input() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(create_json_request(
            "POST",
            "/api/v1/users",
            None,
            Some(json!({
                "username": "al",
                "email": "not-an-email",
                "password": "short",
            })),
        ))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["fields"]["username"].is_string());
    assert!(body["fields"]["email"].is_string());
    assert!(body["fields"]["password"].is_string());
}

#[tokio::test]
async fn test_activate_with_unknown_code() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(create_json_request(
            "PUT",
            "/api/v1/users/activated",
            None,
            Some(json!({ "code": "AAAAAAAAAAAAAAAAAAAAAA" })),
        ))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["fields"]["code"], "invalid or expired activation code");
}

// =============================================================================
// Token Tests
// =============================================================================

#[tokio::test]
async fn test_login_wrong_password() {
    let app = TestApp::new();
    app.register("alice").await;

    let (status, body) = app.login("alice", "wrong-password").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "invalid authentication credentials");

    let (status, _) = app.login("nobody", PASSWORD).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_by_email() {
    let app = TestApp::new();
    app.register("alice").await;

    let (status, _, body) = app
        .send(create_json_request(
            "POST",
            "/api/v1/tokens/authentication",
            None,
            Some(json!({ "email": "alice@example.com", "password": PASSWORD })),
        ))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(body["access_token"].is_string());
    assert!(body["refresh_token"].is_string());
}

#[tokio::test]
async fn test_refresh_issues_access_token() {
    let app = TestApp::new();
    let (_, refresh) = app.active_user("alice").await;

    let (status, _, body) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(&refresh),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body.get("refresh_token").is_none());

    let access = body["access_token"].as_str().unwrap();
    let (status, _, me) = app.send(get("/api/v1/me", Some(access))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "alice");
}

#[tokio::test]
async fn test_refresh_requires_token() {
    let app = TestApp::new();
    let (status, _, _) = app
        .send(create_json_request("POST", "/api/v1/token/refresh", None, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_password_change_revokes_refresh_tokens() {
    let app = TestApp::new();
    let (access, old_refresh) = app.active_user("alice").await;
    let secret_before = app.state.store.get_by_username("alice").await.unwrap().token_hash;

    let (status, _, _) = app
        .send(create_json_request(
            "PATCH",
            "/api/v1/users/alice",
            Some(&access),
            Some(json!({ "password": "another-pa55word" })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let secret_after = app.state.store.get_by_username("alice").await.unwrap().token_hash;
    assert_ne!(secret_before, secret_after);

    // the old refresh token is bound to the previous secret
    let (status, _, body) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(&old_refresh),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid or missing authentication token");

    // the old password no longer works, the new one issues a working pair
    assert_eq!(
        app.login("alice", PASSWORD).await.0,
        StatusCode::UNAUTHORIZED
    );
    let (status, tokens) = app.login("alice", "another-pa55word").await;
    assert_eq!(status, StatusCode::CREATED);

    let new_refresh = tokens["refresh_token"].as_str().unwrap();
    let (status, _, _) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(new_refresh),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

// =============================================================================
// Gate Chain Tests
// =============================================================================

#[tokio::test]
async fn test_change_another_users_password_forbidden() {
    let app = TestApp::new();
    let (alice_access, _) = app.active_user("alice").await;
    app.register("bob").await;

    let (status, _, _) = app
        .send(create_json_request(
            "PATCH",
            "/api/v1/users/bob",
            Some(&alice_access),
            Some(json!({ "password": "another-pa55word" })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_delete_requires_permission() {
    let app = TestApp::new();
    let (access, _) = app.active_user("alice").await;
    app.register("bob").await;

    let delete_bob = || create_json_request("DELETE", "/api/v1/users/bob", Some(&access), None);

    let (status, _, body) = app.send(delete_bob()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "your user account doesn't have the necessary permissions to access this resource"
    );

    let alice = app.state.store.get_by_username("alice").await.unwrap();
    app.state
        .store
        .add_permissions(alice.id, &["users:write"])
        .await
        .unwrap();

    let (status, _, _) = app.send(delete_bob()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = app.send(get("/api/v1/users/bob", Some(&access))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app.send(delete_bob()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_anonymous_is_unauthorized() {
    let app = TestApp::new();
    let (status, _, _) = app
        .send(create_json_request("DELETE", "/api/v1/users/bob", None, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_configured_refresh_path() {
    let mut config = AppConfig::default();
    config.auth.refresh_path = "/api/v1/token/renew".to_string();
    let app = TestApp::with_config(config);
    let (access, refresh) = app.active_user("alice").await;

    let (status, _, body) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/renew",
            Some(&refresh),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["access_token"].is_string());

    // access tokens never mint access tokens, on either path
    let (status, _, _) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/renew",
            Some(&access),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(&access),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app
        .send(create_json_request(
            "POST",
            "/api/v1/token/refresh",
            Some(&refresh),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[tokio::test]
async fn test_unmatched_paths_share_one_metric_series() {
    let app = TestApp::new();

    for i in 0..50 {
        let (status, _, _) = app.send(get(&format!("/scan/x{i}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    for name in ["alice", "bob"] {
        let (status, _, _) = app
            .send(get(&format!("/api/v1/users/{name}"), None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // recording happens on a background task
    for _ in 0..200 {
        if app.state.get_request_count() >= 52 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let metrics = app.state.metrics.read().await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[UNMATCHED].status_counts[&404], 50);
    assert_eq!(metrics["/api/v1/users/:username"].status_counts[&401], 2);
}

