//! Capybook Core - Accounts, record store and configuration
//!
//! This crate defines the pieces the auth service builds on:
//! - Account, permission and activation-code models
//! - The `AccountStore` trait and its in-memory and PostgreSQL implementations
//! - Configuration management

pub mod account;
pub mod config;
pub mod memory;
pub mod postgres;
pub mod store;

pub use account::{Account, NewAccount, Permissions, Verification};
pub use config::{AppConfig, AuthConfig, ConfigError, DatabaseConfig, LoggingConfig, ServerConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{AccountStore, StoreError};
