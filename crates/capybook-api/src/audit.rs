//! Security audit logging for authentication events
//!
//! Every event is logged at INFO level with the "audit" target so it can be
//! filtered and routed separately from application logs.
//!
//! - Events are serialized to JSON for log aggregators
//! - Tokens, passwords and revocation secrets never appear in an event
//!
//! # Example
//!
//! ```ignore
//! use capybook_api::audit::{audit_log, AuditEvent};
//!
//! audit_log(&AuditEvent::LoginSuccess {
//!     account_id: account.id,
//!     username: account.username.clone(),
//!     ip_address: Some("192.168.1.1".to_string()),
//!     user_agent: None,
//! });
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Security audit events for authentication and authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Credentials exchanged for a token pair
    LoginSuccess {
        account_id: i64,
        username: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// Credential exchange rejected
    LoginFailure {
        identifier: String,
        reason: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// Access token minted from a refresh token
    TokenRefresh {
        account_id: i64,
        username: String,
        ip_address: Option<String>,
    },

    /// Bearer token failed validation
    InvalidToken {
        ip_address: Option<String>,
        user_agent: Option<String>,
        reason: String,
    },

    /// Refresh token whose binding key no longer matches the account
    RevokedRefreshToken {
        username: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// Gate rejected the caller
    AccessDenied {
        account_id: Option<i64>,
        username: Option<String>,
        resource: String,
        required_permission: Option<String>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    RegistrationSuccess {
        account_id: i64,
        username: String,
        ip_address: Option<String>,
    },

    RegistrationFailure {
        username: String,
        reason: String,
        ip_address: Option<String>,
    },

    AccountActivated {
        account_id: i64,
        username: String,
    },

    /// Password changed and revocation secret rotated
    PasswordChange {
        account_id: i64,
        username: String,
        ip_address: Option<String>,
    },

    AccountDeleted {
        username: String,
        deleted_by: String,
    },
}

impl AuditEvent {
    fn summary(&self) -> &'static str {
        match self {
            AuditEvent::LoginSuccess { .. } => "Login successful",
            AuditEvent::LoginFailure { .. } => "Login failed",
            AuditEvent::TokenRefresh { .. } => "Token refresh",
            AuditEvent::InvalidToken { .. } => "Invalid token",
            AuditEvent::RevokedRefreshToken { .. } => "Revoked refresh token presented",
            AuditEvent::AccessDenied { .. } => "Access denied",
            AuditEvent::RegistrationSuccess { .. } => "Registration successful",
            AuditEvent::RegistrationFailure { .. } => "Registration failed",
            AuditEvent::AccountActivated { .. } => "Account activated",
            AuditEvent::PasswordChange { .. } => "Password changed",
            AuditEvent::AccountDeleted { .. } => "Account deleted",
        }
    }
}

/// Log a security audit event with structured fields
///
/// The event is serialized to JSON, e.g.
///
/// ```json
/// {
///   "event_type": "login_success",
///   "account_id": 42,
///   "username": "alice",
///   "ip_address": "192.168.1.1",
///   "user_agent": "curl/8.5.0"
/// }
/// ```
pub fn audit_log(event: &AuditEvent) {
    let timestamp = Utc::now();

    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));

    match event {
        AuditEvent::LoginFailure {
            identifier,
            reason,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                identifier = %identifier,
                reason = %reason,
                ip_address = ?ip_address,
                "{}",
                event.summary()
            );
        }
        AuditEvent::AccessDenied {
            username,
            resource,
            required_permission,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                username = ?username,
                resource = %resource,
                required_permission = ?required_permission,
                ip_address = ?ip_address,
                "{}",
                event.summary()
            );
        }
        AuditEvent::InvalidToken {
            ip_address, reason, ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                ip_address = ?ip_address,
                reason = %reason,
                "{}",
                event.summary()
            );
        }
        _ => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                "{}",
                event.summary()
            );
        }
    }
}

/// Client details attached to audit events
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        Self {
            ip_address: extract_ip_address(headers),
            user_agent: extract_user_agent(headers),
        }
    }
}

/// Extract the client IP address from proxy headers
///
/// Checks X-Forwarded-For, then X-Real-IP.
pub fn extract_ip_address(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(xff) = headers.get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            // first hop is the client
            if let Some(first_ip) = xff_str.split(',').next() {
                return Some(first_ip.trim().to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return Some(ip_str.to_string());
        }
    }

    None
}

/// Extract the user agent from request headers
pub fn extract_user_agent(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::LoginSuccess {
            account_id: 42,
            username: "alice".to_string(),
            ip_address: Some("192.168.1.1".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"login_success\""));
        assert!(json.contains("alice"));
    }

    #[test]
    fn test_revoked_refresh_token_event_tag() {
        let event = AuditEvent::RevokedRefreshToken {
            username: "alice".to_string(),
            ip_address: None,
            user_agent: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "revoked_refresh_token");
    }

    #[test]
    fn test_audit_log_does_not_panic() {
        audit_log(&AuditEvent::LoginFailure {
            identifier: "alice".to_string(),
            reason: "invalid authentication credentials".to_string(),
            ip_address: Some("192.168.1.1".to_string()),
            user_agent: Some("Test Agent".to_string()),
        });
        audit_log(&AuditEvent::AccessDenied {
            account_id: Some(1),
            username: Some("alice".to_string()),
            resource: "/api/v1/users/bob".to_string(),
            required_permission: Some("users:write".to_string()),
            ip_address: None,
            user_agent: None,
        });
        audit_log(&AuditEvent::AccountActivated {
            account_id: 1,
            username: "alice".to_string(),
        });
    }

    #[test]
    fn test_extract_ip_from_x_forwarded_for() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.1, 198.51.100.1".parse().unwrap(),
        );

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_ip_from_x_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.1".parse().unwrap());

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_missing_headers() {
        let headers = axum::http::HeaderMap::new();

        assert_eq!(extract_ip_address(&headers), None);
        assert_eq!(extract_user_agent(&headers), None);
    }
}
