//! Application state management

use crate::auth::middleware::AuthGate;
use crate::auth::service::AuthService;
use crate::auth::token::TokenService;
use crate::mailer::Mailer;
use capybook_core::{AccountStore, AppConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Per-endpoint request statistics
#[derive(Debug, Clone, Default)]
pub struct EndpointMetrics {
    /// Response counts keyed by status code
    pub status_counts: BTreeMap<u16, u64>,
    pub latency_count: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

/// Result of resolving a request's bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Anonymous,
    Resolved,
    Rejected,
}

/// Counters for [`AuthOutcome`]
#[derive(Debug, Default)]
pub struct AuthOutcomeCounters {
    pub anonymous: AtomicU64,
    pub resolved: AtomicU64,
    pub rejected: AtomicU64,
}

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Record store
    pub store: Arc<dyn AccountStore>,
    /// Bearer token resolution
    pub gate: AuthGate,
    /// Account and credential operations
    pub auth: AuthService,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
    /// Per-endpoint statistics
    pub metrics: RwLock<BTreeMap<String, EndpointMetrics>>,
    pub auth_outcomes: AuthOutcomeCounters,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        tokens: TokenService,
        store: Arc<dyn AccountStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let gate = AuthGate::new(tokens.clone(), store.clone(), &config.auth);
        let auth = AuthService::new(store.clone(), tokens, mailer, &config.auth);

        Self {
            config,
            store,
            gate,
            auth,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            metrics: RwLock::new(BTreeMap::new()),
            auth_outcomes: AuthOutcomeCounters::default(),
        }
    }

    /// Replace the account service, e.g. to lower Argon2 costs in tests
    pub fn with_auth_service(mut self, auth: AuthService) -> Self {
        self.auth = auth;
        self
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record one finished request
    pub async fn record_request(&self, endpoint: String, status: u16, latency_us: u64) {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(endpoint).or_default();
        *entry.status_counts.entry(status).or_insert(0) += 1;
        entry.latency_count += 1;
        entry.total_latency_us += latency_us;
        entry.max_latency_us = entry.max_latency_us.max(latency_us);
    }

    pub fn record_auth_outcome(&self, outcome: AuthOutcome) {
        let counter = match outcome {
            AuthOutcome::Anonymous => &self.auth_outcomes.anonymous,
            AuthOutcome::Resolved => &self.auth_outcomes.resolved,
            AuthOutcome::Rejected => &self.auth_outcomes.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// (anonymous, resolved, rejected)
    pub fn auth_outcome_counts(&self) -> (u64, u64, u64) {
        (
            self.auth_outcomes.anonymous.load(Ordering::Relaxed),
            self.auth_outcomes.resolved.load(Ordering::Relaxed),
            self.auth_outcomes.rejected.load(Ordering::Relaxed),
        )
    }
}
