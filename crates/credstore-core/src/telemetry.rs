//! Tracing initialisation

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const FALLBACK_FILTER: &str = "info";

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// Install the global subscriber, failing if one is already set
pub fn try_init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| Error::invalid_config(format!("tracing already initialised: {}", e)))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(config: &LoggingConfig) {
    let _ = try_init_tracing(config);
}
