//! Authentication and authorization module
//!
//! - Token issuance and validation with revocation-secret binding
//! - Request authentication and the authorization gate chain
//! - Password hashing with Argon2
//! - Account and credential service

pub mod middleware;
pub mod password;
pub mod service;
pub mod token;

pub use middleware::{
    authenticate, check_activated, check_authenticated, check_permission, require_activated,
    require_authenticated, require_permission, AuthError, AuthGate, CurrentAccount, Identity,
};
pub use password::{hash_password, verify_password, PasswordConfig, PasswordError};
pub use service::{AccountView, AuthService, TokenPair};
pub use token::{AccessClaims, RefreshClaims, SigningKey, TokenClaims, TokenError, TokenKind, TokenService};
