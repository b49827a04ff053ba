//! HTTP middleware
//!
//! Authentication and the gate chain live in [`crate::auth::middleware`].

pub mod metrics;

pub use metrics::metrics_middleware;
