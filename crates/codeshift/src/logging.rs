//! Tracing subscriber setup.
//!
//! Library code logs through `tracing` in the execution path and `log` in
//! the storage path; `log` records are bridged into the same subscriber.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::ConfigError;

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "CODESHIFT_LOG";

/// Builds the filter from `CODESHIFT_LOG`, falling back to the configured level.
pub fn build_env_filter(settings: &LoggingSettings) -> Result<EnvFilter, ConfigError> {
    let directives = match std::env::var(LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => settings.level.clone(),
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| ConfigError::Logging(format!("invalid filter '{}': {}", directives, e)))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), ConfigError> {
    let filter = build_env_filter(settings)?;

    let layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_log::LogTracer::init().map_err(|e| ConfigError::Logging(e.to_string()))?;

    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    tracing::debug!(level = %settings.level, json = settings.json, "Logging initialized");
    Ok(())
}
