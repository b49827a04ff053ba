//! Capybook configuration management
//!
//! Handles configuration from environment variables and TOML files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Token issuance and validation settings
    pub auth: AuthConfig,

    /// Record store connection
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply every variable `lookup` yields on top of this configuration
    ///
    /// A key source found in `lookup` (`JWT_SECRET` or either RSA path)
    /// replaces the configured one as a whole.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Server
        if let Some(host) = lookup("API_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("API_PORT") {
            self.server.port = parse_var("API_PORT", port)?;
        }

        // Signing key
        let secret = lookup("JWT_SECRET");
        let private_key = lookup("JWT_PRIVATE_KEY_PATH");
        let public_key = lookup("JWT_PUBLIC_KEY_PATH");
        if secret.is_some() || private_key.is_some() || public_key.is_some() {
            self.auth.jwt_secret = secret;
            self.auth.jwt_private_key_path = private_key.map(PathBuf::from);
            self.auth.jwt_public_key_path = public_key.map(PathBuf::from);
        }

        // Token policy
        if let Some(issuer) = lookup("JWT_ISSUER") {
            self.auth.issuer = issuer;
        }
        if let Some(ttl) = lookup("JWT_ACCESS_TTL_SECS") {
            self.auth.access_ttl_secs = parse_var("JWT_ACCESS_TTL_SECS", ttl)?;
        }
        if let Some(path) = lookup("AUTH_REFRESH_PATH") {
            self.auth.refresh_path = path;
        }
        if let Some(ms) = lookup("AUTH_LOOKUP_TIMEOUT_MS") {
            self.auth.lookup_timeout_ms = parse_var("AUTH_LOOKUP_TIMEOUT_MS", ms)?;
        }
        if let Some(len) = lookup("AUTH_REVOCATION_SECRET_LEN") {
            self.auth.revocation_secret_len = parse_var("AUTH_REVOCATION_SECRET_LEN", len)?;
        }
        if let Some(hours) = lookup("AUTH_VERIFICATION_TTL_HOURS") {
            self.auth.verification_ttl_hours = parse_var("AUTH_VERIFICATION_TTL_HOURS", hours)?;
        }

        // PostgreSQL
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.postgres_url = Some(url);
        }

        // Logging
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.json_format = format.eq_ignore_ascii_case("json");
        }

        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec![],
        }
    }
}

/// Token issuance and validation configuration
///
/// Exactly one of `jwt_secret` (HS256) or the RSA key pair
/// (`jwt_private_key_path` + `jwt_public_key_path`, RS256) must be set.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for HMAC signing
    pub jwt_secret: Option<String>,

    /// PEM-encoded RSA private key used for signing
    pub jwt_private_key_path: Option<PathBuf>,

    /// PEM-encoded RSA public key used for verification
    pub jwt_public_key_path: Option<PathBuf>,

    /// Issuer tag embedded in every token
    pub issuer: String,

    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,

    /// Route on which bearer tokens are validated as refresh tokens
    pub refresh_path: String,

    /// Upper bound for a single record store round-trip
    pub lookup_timeout_ms: u64,

    /// Length of generated revocation secrets
    pub revocation_secret_len: usize,

    /// Lifetime of account activation codes
    pub verification_ttl_hours: i64,
}

impl AuthConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_private_key_path: None,
            jwt_public_key_path: None,
            issuer: "capybook.auth.service".to_string(),
            access_ttl_secs: 24 * 60 * 60,
            refresh_path: "/api/v1/token/refresh".to_string(),
            lookup_timeout_ms: 3000,
            revocation_secret_len: 32,
            verification_ttl_hours: 72,
        }
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("jwt_private_key_path", &self.jwt_private_key_path)
            .field("jwt_public_key_path", &self.jwt_public_key_path)
            .field("issuer", &self.issuer)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_path", &self.refresh_path)
            .field("lookup_timeout_ms", &self.lookup_timeout_ms)
            .field("revocation_secret_len", &self.revocation_secret_len)
            .field("verification_ttl_hours", &self.verification_ttl_hours)
            .finish()
    }
}

/// Record store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory store is used when unset
    pub postgres_url: Option<String>,

    /// PostgreSQL connection pool size
    pub postgres_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            postgres_pool_size: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
