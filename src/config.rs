//! Application-wide configuration and constants.
//!
//! Configuration is layered with figment: compiled-in defaults, then an optional
//! TOML file (`fleet.toml`, or the path in `FLEET_CONFIG`), then an optional
//! `fleet.yaml`, then `FLEET_`-prefixed environment variables using `__` as the
//! section separator (e.g. `FLEET_POOL__MAX_SIZE=20`).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::MembershipConfig;
use crate::credentials::{CredentialEntry, RotationConfig};
use crate::error::{AppError, Result};
use crate::reliability::CircuitBreakerConfig;
use crate::upstream::{PoolConfig, UpstreamConfig};

/// Serde helper for Duration serialization/deserialization as seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Circuit breaker defaults
pub mod circuit_breaker {
    use std::time::Duration;

    /// Failures within the monitor window that trip the breaker
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

    /// Cool-down before an open breaker admits probe calls
    pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

    /// Consecutive half-open successes needed to close
    pub const DEFAULT_HALF_OPEN_MAX_ATTEMPTS: u32 = 2;

    /// Sliding window over which failures are counted
    pub const DEFAULT_MONITOR_WINDOW: Duration = Duration::from_secs(60);
}

/// Connection pool defaults
pub mod connection_pool {
    use std::time::Duration;

    /// Maximum number of pooled connections
    pub const DEFAULT_MAX_SIZE: usize = 10;

    /// Connections kept warm against the default base URL
    pub const DEFAULT_MIN_SIZE: usize = 2;

    /// Idle time after which a connection above `min_size` is evicted
    pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(60);

    /// Time a caller may wait for a connection
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Period of the idle/liveness sweep
    pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

    /// Base URL used for warm-up and refill
    pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
}

/// Upstream HTTP defaults
pub mod upstream {
    use std::time::Duration;

    /// Chat completion path appended to a node base URL
    pub const DEFAULT_CHAT_PATH: &str = "/v1/chat/completions";

    /// Lightweight path used for liveness probes
    pub const DEFAULT_LIVENESS_PATH: &str = "/health";

    /// Per-request timeout for upstream calls
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    /// Timeout for a single liveness probe
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Credential rotation defaults
pub mod credentials {
    use std::time::Duration;

    /// Consecutive failures on the active slot before rotating
    pub const DEFAULT_MAX_FAILURES: u32 = 2;

    /// Window during which a failed slot is avoided
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

    /// Model used when a slot has no assigned model
    pub const DEFAULT_MODEL: &str = "default";

    /// Prefix of numbered credential environment entries (`FLEET_CREDENTIAL_1`, ...)
    pub const NUMBERED_ENV_PREFIX: &str = "FLEET_CREDENTIAL_";

    /// Legacy two-slot credential variables
    pub const LEGACY_ENV_KEYS: [&str; 2] = ["FLEET_API_KEY", "FLEET_API_KEY_2"];

    /// Legacy two-slot model variables
    pub const LEGACY_ENV_MODELS: [&str; 2] = ["FLEET_MODEL", "FLEET_MODEL_2"];
}

/// Cluster membership defaults
pub mod cluster {
    use std::time::Duration;

    /// Period of the node-timeout sweep
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

    /// Silence after which a node is marked offline
    pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default UDP address of the discovery listener
    pub const DEFAULT_DISCOVERY_BIND: &str = "0.0.0.0:7946";

    /// Largest discovery datagram accepted
    pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

    /// Capacity of the membership event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

fn default_server_host() -> String { "0.0.0.0".to_string() }
fn default_server_port() -> u16 { 8090 }
fn default_log_level() -> String { "info".to_string() }
fn default_discovery_bind() -> String { cluster::DEFAULT_DISCOVERY_BIND.to_string() }
fn default_true() -> bool { true }

/// Observability HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// A node known at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticNode {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    /// Models the node is expected to serve before its first heartbeat
    #[serde(default)]
    pub models: Vec<String>,
}

/// UDP discovery listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_bind")]
    pub bind_addr: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_discovery_bind(),
        }
    }
}

/// Cluster membership section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(flatten)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub nodes: Vec<StaticNode>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Credential section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(flatten)]
    pub rotation: RotationConfig,
    /// Ordered credential entries; when empty, numbered env entries are used
    #[serde(default)]
    pub entries: Vec<CredentialEntry>,
}

/// Application configuration loaded from multiple sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Load configuration from defaults, config files and the environment.
    pub fn load() -> Result<Self> {
        let toml_path = env::var("FLEET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("fleet.toml"));
        Self::load_from(Self::figment(toml_path))
    }

    /// Extract and validate a configuration from an arbitrary figment.
    pub fn load_from(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract()?;
        config.validate()?;
        debug!(?config.pool, ?config.breaker, "Configuration loaded");
        Ok(config)
    }

    /// The layered figment used by [`Config::load`].
    pub fn figment(toml_path: PathBuf) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml_path))
            .merge(Yaml::file("fleet.yaml"))
            .merge(Env::prefixed("FLEET_").split("__"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(AppError::Configuration(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if pool.min_size > pool.max_size {
            return Err(AppError::Configuration(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        if !is_http_url(&pool.default_base_url) {
            return Err(AppError::Configuration(
                "pool.default_base_url must start with http:// or https://".to_string(),
            ));
        }
        if pool.acquire_timeout.is_zero() || pool.health_check_interval.is_zero() {
            return Err(AppError::Configuration(
                "pool.acquire_timeout and pool.health_check_interval must be non-zero".to_string(),
            ));
        }

        let breaker = &self.breaker;
        if breaker.failure_threshold == 0 || breaker.half_open_max_attempts == 0 {
            return Err(AppError::Configuration(
                "breaker.failure_threshold and breaker.half_open_max_attempts must be at least 1"
                    .to_string(),
            ));
        }
        if breaker.monitor_window.is_zero() {
            return Err(AppError::Configuration(
                "breaker.monitor_window must be non-zero".to_string(),
            ));
        }

        let membership = &self.cluster.membership;
        if membership.heartbeat_interval.is_zero() {
            return Err(AppError::Configuration(
                "cluster.heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if membership.node_timeout < membership.heartbeat_interval {
            return Err(AppError::Configuration(format!(
                "cluster.node_timeout ({:?}) is shorter than cluster.heartbeat_interval ({:?})",
                membership.node_timeout, membership.heartbeat_interval
            )));
        }
        for node in &self.cluster.nodes {
            if node.host.trim().is_empty() || node.port == 0 {
                return Err(AppError::Configuration(format!(
                    "static node {:?} needs a host and a non-zero port",
                    node
                )));
            }
        }

        if self.credentials.rotation.max_failures == 0 {
            return Err(AppError::Configuration(
                "credentials.max_failures must be at least 1".to_string(),
            ));
        }

        if self.server.host.is_empty() {
            return Err(AppError::Configuration(
                "server.host cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Configuration(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| AppError::Configuration(format!("Failed to serialize to YAML: {}", e)))
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn figment_for(toml: &str) -> (Figment, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file.path()));
        (figment, file)
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.breaker.half_open_max_attempts, 2);
        assert_eq!(config.breaker.monitor_window, Duration::from_secs(60));
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.credentials.rotation.max_failures, 2);
        assert_eq!(config.credentials.rotation.cooldown, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_are_layered_on_defaults() {
        let (figment, _file) = figment_for(
            r#"
            [pool]
            max_size = 4
            min_size = 1
            acquire_timeout = 2

            [cluster]
            heartbeat_interval = 5
            node_timeout = 15

            [[cluster.nodes]]
            host = "10.0.0.5"
            port = 11434
            name = "gpu-a"

            [[credentials.entries]]
            key = "sk-one"
            model = "llama3"
            "#,
        );

        let config = Config::load_from(figment).unwrap();
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.pool.max_idle_time, Duration::from_secs(60));
        assert_eq!(config.cluster.membership.node_timeout, Duration::from_secs(15));
        assert_eq!(config.cluster.nodes[0].name.as_deref(), Some("gpu-a"));
        assert_eq!(config.credentials.entries[0].model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_min_size_above_max_size_is_rejected() {
        let (figment, _file) = figment_for(
            r#"
            [pool]
            max_size = 1
            min_size = 3
            "#,
        );
        assert!(matches!(
            Config::load_from(figment),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_node_timeout_shorter_than_heartbeat_is_rejected() {
        let mut config = Config::default();
        config.cluster.membership.node_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("failure_threshold = 5"));
    }
}
