//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (so `RUST_LOG`
//! overrides the configured level) and either compact or JSON output.

use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use crate::config::LoggingConfig;

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,
    /// Whether to emit JSON lines.
    pub json: bool,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "fleet-router".to_string(),
            json: false,
            log_level: "info".to_string(),
        }
    }
}

impl From<&LoggingConfig> for TracingConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            json: logging.json,
            log_level: logging.level.clone(),
            ..Default::default()
        }
    }
}

/// Build the filter: `RUST_LOG` if set and valid, else the configured level.
fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Initialize the global tracing subscriber.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = Registry::default().with(env_filter(&config));

    if config.json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true),
            )
            .try_init()?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()?;
    }

    info!(service = %config.service_name, json = config.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let config = TracingConfig::from(&logging);
        assert!(config.json);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.service_name, "fleet-router");
    }
}
