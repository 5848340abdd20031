//! Configuration for the inference core.

use std::collections::HashMap;
use std::time::Duration;

use config::{builder::DefaultState, Config as ConfigLoader, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::moderation::FailurePolicy;
use crate::pool::{AcquireMode, WorkerPool};
use crate::relay::DEFAULT_MAX_LINE_BYTES;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Upstream endpoints keyed by model kind (e.g. "glm2", "wukong").
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointsConfig>,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Endpoints of one model kind.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    /// Upstream addresses; the pool capacity is their count.
    pub urls: Vec<String>,
    /// How batch work of this kind waits for an endpoint.
    #[serde(default)]
    pub acquire: AcquireMode,
    /// Upper bound on a blocking acquire. Unset waits indefinitely.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

impl EndpointsConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    /// Text moderation service URL. Without it every text passes.
    #[serde(default)]
    pub url: Option<String>,
    /// What to do when the moderation service cannot answer.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Forwarded tokens between two mid-stream checks; 0 disables them.
    #[serde(default = "default_check_every_tokens")]
    pub check_every_tokens: usize,
    #[serde(default = "default_moderation_timeout")]
    pub timeout_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            url: None,
            failure_policy: FailurePolicy::default(),
            check_every_tokens: default_check_every_tokens(),
            timeout_secs: default_moderation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Buffered events between a stream reader and its consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total timeout for one-shot (non-streaming) calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Longest upstream stream line accepted.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Tasks younger than this are left for a later tick.
    #[serde(default)]
    pub window_secs: u64,
    /// Maximum tasks read from the repository per kind per tick.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Task kinds the controller dispatches.
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            window_secs: 0,
            batch_limit: default_batch_limit(),
            kinds: vec![],
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_check_every_tokens() -> usize {
    6
}
fn default_moderation_timeout() -> u64 {
    10
}
fn default_channel_capacity() -> usize {
    32
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}
fn default_max_parallel() -> usize {
    8
}
fn default_tick_interval() -> u64 {
    30
}
fn default_batch_limit() -> usize {
    8
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (BIGMODEL__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::builder()?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("BIGMODEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document, applying the same defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = Self::builder()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())
    }

    /// Reject configurations the pools cannot be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, endpoints) in &self.endpoints {
            if endpoints.urls.is_empty() {
                return Err(ConfigError::Message(format!(
                    "endpoints.{} has no urls",
                    kind
                )));
            }
        }
        if self.workers.max_parallel == 0 {
            return Err(ConfigError::Message(
                "workers.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.workers.max_parallel > WorkerPool::MAX_CAPACITY as usize {
            return Err(ConfigError::Message(format!(
                "workers.max_parallel must be at most {}",
                WorkerPool::MAX_CAPACITY
            )));
        }
        if self.stream.max_line_bytes == 0 {
            return Err(ConfigError::Message(
                "stream.max_line_bytes must be at least 1".to_string(),
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::Message(
                "stream.channel_capacity must be at least 1".to_string(),
            ));
        }
        for kind in &self.admission.kinds {
            if !self.endpoints.contains_key(kind) {
                return Err(ConfigError::Message(format!(
                    "admission kind '{}' has no endpoints configured",
                    kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.moderation.check_every_tokens, 6);
        assert_eq!(config.moderation.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.workers.max_parallel, 8);
        assert_eq!(config.admission.batch_limit, 8);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_endpoints_section() {
        let config = Config::from_toml(
            r#"
            [endpoints.glm2]
            urls = ["http://a:8000", "http://b:8000"]
            acquire = "blocking"
            acquire_timeout_secs = 120

            [endpoints.wukong]
            urls = ["http://c:8000"]

            [admission]
            kinds = ["wukong"]
            window_secs = 5
            "#,
        )
        .unwrap();

        let glm2 = &config.endpoints["glm2"];
        assert_eq!(glm2.urls.len(), 2);
        assert_eq!(glm2.acquire, AcquireMode::Blocking);
        assert_eq!(glm2.acquire_timeout(), Some(Duration::from_secs(120)));

        let wukong = &config.endpoints["wukong"];
        assert_eq!(wukong.acquire, AcquireMode::NonBlocking);
        assert!(wukong.acquire_timeout().is_none());
        assert_eq!(config.admission.window_secs, 5);
    }

    #[test]
    fn test_rejects_empty_endpoint_list() {
        let err = Config::from_toml(
            r#"
            [endpoints.glm2]
            urls = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("glm2"));
    }

    #[test]
    fn test_rejects_admission_kind_without_endpoints() {
        let result = Config::from_toml(
            r#"
            [admission]
            kinds = ["wukong"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_oversized_worker_pool() {
        let err = Config::from_toml(
            r#"
            [workers]
            max_parallel = 100000
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at most 65535"));
    }

    #[test]
    fn test_max_line_bytes() {
        assert_eq!(Config::from_toml("").unwrap().stream.max_line_bytes, 1 << 20);
        let config = Config::from_toml(
            r#"
            [stream]
            max_line_bytes = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.max_line_bytes, 4096);
        assert!(Config::from_toml("[stream]\nmax_line_bytes = 0").is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = Config::from_toml(
            r#"
            [workers]
            max_parallel = 0
            "#,
        );
        assert!(result.is_err());
    }
}
