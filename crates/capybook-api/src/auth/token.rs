//! Access and refresh token issuance and validation
//!
//! Tokens are compact JWS strings signed with the single key configured at
//! startup (HS256 shared secret or RS256 key pair). Two claim shapes exist,
//! discriminated by the `kind` claim:
//!
//! - access tokens carry an expiry and are accepted on every route except
//!   the refresh route;
//! - refresh tokens carry no expiry but embed a binding key,
//!   `hex(HMAC-SHA256(key = revocation secret, msg = username))`. Rotating an
//!   account's revocation secret therefore revokes all of its refresh tokens
//!   without a denylist.

use capybook_core::{Account, AuthConfig};
use hmac::{Hmac, Mac};
use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token kind tag carried in the `kind` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// Claims of a short-lived access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject - username
    pub sub: String,
    /// Token issuer
    pub iss: String,
    /// Issued at (Unix epoch)
    pub iat: u64,
    /// Expiration (Unix epoch)
    pub exp: u64,
}

/// Claims of a refresh token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// Subject - username
    pub sub: String,
    /// Token issuer
    pub iss: String,
    /// Issued at (Unix epoch)
    pub iat: u64,
    /// Hex HMAC of the username under the account's revocation secret
    pub binding_key: String,
}

/// Every claim shape the service signs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenClaims {
    Access(AccessClaims),
    Refresh(RefreshClaims),
}

impl TokenClaims {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenClaims::Access(_) => TokenKind::Access,
            TokenClaims::Refresh(_) => TokenKind::Refresh,
        }
    }
}

/// Token errors
///
/// Every validation failure (bad signature, malformed token, expiry, wrong
/// issuer, wrong kind, empty subject) is reported as `InvalidToken`.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("invalid token: authentication failed")]
    InvalidToken,

    #[error("No signing key configured")]
    MissingSigningKey,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// Key material for the single configured signing scheme
pub enum SigningKey {
    /// HS256 shared secret
    Hmac(Vec<u8>),
    /// RS256 PEM key pair
    Rsa {
        private_pem: Vec<u8>,
        public_pem: Vec<u8>,
    },
}

/// Issues and validates access and refresh tokens
#[derive(Clone)]
pub struct TokenService {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Build a service around exactly one signing key
    pub fn new(
        key: SigningKey,
        issuer: impl Into<String>,
        access_ttl: Duration,
    ) -> Result<Self, TokenError> {
        let (algorithm, encoding_key, decoding_key) = match key {
            SigningKey::Hmac(secret) => {
                if secret.is_empty() {
                    return Err(TokenError::MissingSigningKey);
                }
                (
                    Algorithm::HS256,
                    EncodingKey::from_secret(&secret),
                    DecodingKey::from_secret(&secret),
                )
            }
            SigningKey::Rsa {
                private_pem,
                public_pem,
            } => (
                Algorithm::RS256,
                EncodingKey::from_rsa_pem(&private_pem)
                    .map_err(|e| TokenError::InvalidKey(format!("private key: {e}")))?,
                DecodingKey::from_rsa_pem(&public_pem)
                    .map_err(|e| TokenError::InvalidKey(format!("public key: {e}")))?,
            ),
        };

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            issuer: issuer.into(),
            access_ttl,
        })
    }

    /// Build a service from configuration
    ///
    /// Fails unless exactly one of `jwt_secret` or the RSA key pair is set.
    pub fn from_config(config: &AuthConfig) -> Result<Self, TokenError> {
        let key = match (
            &config.jwt_secret,
            &config.jwt_private_key_path,
            &config.jwt_public_key_path,
        ) {
            (Some(secret), None, None) => SigningKey::Hmac(secret.as_bytes().to_vec()),
            (None, Some(private_path), Some(public_path)) => SigningKey::Rsa {
                private_pem: read_key(private_path)?,
                public_pem: read_key(public_path)?,
            },
            (None, None, None) => return Err(TokenError::MissingSigningKey),
            _ => {
                return Err(TokenError::InvalidKey(
                    "configure either JWT_SECRET or both RSA key paths, not a mix".to_string(),
                ))
            }
        };

        Self::new(
            key,
            config.issuer.clone(),
            Duration::from_secs(config.access_ttl_secs),
        )
    }

    /// Signing algorithm in use
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Lifetime of issued access tokens
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Issue a short-lived access token for `account`
    pub fn issue_access_token(&self, account: &Account) -> Result<String, TokenError> {
        let now = get_current_timestamp();
        self.sign(&TokenClaims::Access(AccessClaims {
            sub: account.username.clone(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now.saturating_add(self.access_ttl.as_secs()),
        }))
    }

    /// Issue a refresh token bound to the account's current revocation secret
    pub fn issue_refresh_token(&self, account: &Account) -> Result<String, TokenError> {
        self.sign(&TokenClaims::Refresh(RefreshClaims {
            sub: account.username.clone(),
            iss: self.issuer.clone(),
            iat: get_current_timestamp(),
            binding_key: Self::derive_binding_key(&account.username, &account.token_hash),
        }))
    }

    /// Validate an access token and return its claims
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        match self.decode_claims(token, TokenKind::Access)? {
            TokenClaims::Access(claims) if !claims.sub.is_empty() => Ok(claims),
            _ => Err(TokenError::InvalidToken),
        }
    }

    /// Validate a refresh token's signature and structure
    ///
    /// The binding key is NOT compared here; callers check it against the
    /// account's live revocation secret with [`TokenService::binding_key_matches`].
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        match self.decode_claims(token, TokenKind::Refresh)? {
            TokenClaims::Refresh(claims) if !claims.sub.is_empty() => Ok(claims),
            _ => Err(TokenError::InvalidToken),
        }
    }

    /// `hex(HMAC-SHA256(key = revocation_secret, msg = username))`
    pub fn derive_binding_key(username: &str, revocation_secret: &str) -> String {
        hex::encode(binding_mac(username, revocation_secret).finalize().into_bytes())
    }

    /// Constant-time check of an embedded binding key against the live secret
    pub fn binding_key_matches(username: &str, revocation_secret: &str, binding_key: &str) -> bool {
        match hex::decode(binding_key) {
            Ok(expected) => binding_mac(username, revocation_secret)
                .verify_slice(&expected)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Fresh alphanumeric revocation secret drawn from the OS CSPRNG
    pub fn generate_revocation_secret(length: usize) -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(TokenError::Signing)
    }

    fn decode_claims(&self, token: &str, kind: TokenKind) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;
        match kind {
            TokenKind::Access => validation.set_required_spec_claims(&["exp", "iss", "sub"]),
            TokenKind::Refresh => {
                validation.set_required_spec_claims(&["iss", "sub"]);
                validation.validate_exp = false;
            }
        }

        let claims = decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(expected = %kind, error = %e, "token rejected");
                TokenError::InvalidToken
            })?
            .claims;

        if claims.kind() != kind {
            tracing::debug!(expected = %kind, actual = %claims.kind(), "token kind mismatch");
            return Err(TokenError::InvalidToken);
        }

        Ok(claims)
    }
}

fn binding_mac(username: &str, revocation_secret: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(revocation_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(username.as_bytes());
    mac
}

fn read_key(path: &std::path::Path) -> Result<Vec<u8>, TokenError> {
    std::fs::read(path).map_err(|e| TokenError::InvalidKey(format!("{}: {e}", path.display())))
}
