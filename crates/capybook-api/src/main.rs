//! Capybook API Server
//!
//! Bearer token service for the Capybook catalogue.

use anyhow::Context;
use capybook_api::{auth::TokenService, create_router, mailer::LogMailer, state::AppState};
use capybook_core::{AccountStore, AppConfig, MemoryStore, PgStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capybook-api")]
#[command(about = "Capybook bearer token service", version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };

    init_tracing(&config);

    anyhow::ensure!(
        config.auth.refresh_path.starts_with('/'),
        "refresh path must be absolute, got {:?}",
        config.auth.refresh_path
    );

    // A missing or unreadable signing key is fatal
    let tokens = TokenService::from_config(&config.auth).context("token signing key")?;
    tracing::info!(
        algorithm = ?tokens.algorithm(),
        access_ttl_secs = tokens.access_ttl().as_secs(),
        refresh_path = %config.auth.refresh_path,
        "Token service ready"
    );

    let store: Arc<dyn AccountStore> = match &config.database.postgres_url {
        Some(url) => {
            let store = PgStore::new(url, config.database.postgres_pool_size).await?;
            store.migrate().await?;
            tracing::info!("Using PostgreSQL record store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, accounts are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, tokens, store, Arc::new(LogMailer)));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Capybook API Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let level = &config.logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("capybook_api={level},capybook_core={level},tower_http={level},audit=info").into()
    });

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
