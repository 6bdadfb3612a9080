pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;

use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::filter::AdmissionFilter;
use crate::handlers::{accepted_handler, health_handler, metrics_handler};

/// Gateway router with every route, fallback included, behind `admission`.
pub fn app(admission: Arc<AdmissionFilter>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(accepted_handler)
        .layer(middleware::from_fn_with_state(admission, filter::handle))
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
