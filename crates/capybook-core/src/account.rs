//! Account records owned by the record store
//!
//! An account carries two secrets that never leave the server: the password
//! hash and the revocation secret (`token_hash`). Rotating the revocation
//! secret invalidates every refresh token issued against the previous value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stored user account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable numeric identity
    pub id: i64,

    /// Unique login name, also the token subject
    pub username: String,

    /// Unique email address
    pub email: String,

    /// Argon2id PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// Revocation secret, rewritten on every password change
    #[serde(skip_serializing)]
    pub token_hash: String,

    /// Whether the email address has been confirmed
    pub activated: bool,

    /// Account creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Replace the password hash and the revocation secret together.
    ///
    /// This is the only mutation that touches `token_hash`, so the secret
    /// changes if and only if the password does.
    pub fn change_password(&mut self, password_hash: String, token_hash: String) {
        self.password_hash = password_hash;
        self.token_hash = token_hash;
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("activated", &self.activated)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Account fields supplied at registration; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub token_hash: String,
    pub activated: bool,
}

/// Set of permission codes granted to an account (e.g. `books:read`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    pub fn includes(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Pending account activation code
///
/// Only the SHA-256 hash of the plaintext code is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub code_hash: Vec<u8>,
    pub account_id: i64,
    pub expiry: DateTime<Utc>,
}

impl Verification {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_account() -> Account {
        Account {
            id: 1,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$hash".to_string(),
            token_hash: "s1".to_string(),
            activated: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_secrets_not_serialized() {
        let json = serde_json::to_value(sample_account()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("token_hash").is_none());
        assert_eq!(json["username"], "alice");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", sample_account());
        assert!(!rendered.contains("argon2id"));
        assert!(!rendered.contains("token_hash"));
    }

    #[test]
    fn test_change_password_rotates_secret() {
        let mut account = sample_account();
        account.change_password("$argon2id$new".to_string(), "s2".to_string());
        assert_eq!(account.password_hash, "$argon2id$new");
        assert_eq!(account.token_hash, "s2");
    }

    #[test]
    fn test_permissions_includes() {
        let perms: Permissions = ["books:read", "users:write"].into_iter().collect();
        assert!(perms.includes("books:read"));
        assert!(!perms.includes("books:write"));
        assert_eq!(perms.len(), 2);
        assert!(Permissions::default().is_empty());
    }

    #[test]
    fn test_verification_expiry() {
        let now = Utc::now();
        let verification = Verification {
            code_hash: vec![0; 32],
            account_id: 1,
            expiry: now + Duration::hours(1),
        };
        assert!(!verification.is_expired_at(now));
        assert!(verification.is_expired_at(now + Duration::hours(2)));
    }
}
