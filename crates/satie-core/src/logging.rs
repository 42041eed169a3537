//! Logging initialization.
//!
//! Call one of these once at startup, before `Server::serve`. The filter
//! comes from `RUST_LOG` when set, otherwise the level passed in (or the
//! `LOG_LEVEL` configuration default).

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize formatted logging to stdout.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize JSON-formatted logging, for log aggregation in production.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
