pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            max_body_bytes: default_max_body_bytes(),
            runtime_worker_threads: None,
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// The text-generation service being relayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Completion endpoint receiving the streaming POST.
    pub url: String,
    /// Extra request headers, e.g. `Authorization`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_pool_max_idle_per_host() -> usize {
    16
}
fn default_pool_idle_timeout_secs() -> u64 {
    15
}

impl UpstreamConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            use_env_proxy: false,
            proxy: None,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    #[must_use]
    pub fn with_upstream(url: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::new(url),
            features: FeaturesConfig::default(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_body_bytes, 1024 * 1024);
        assert!(config.upstream.url.starts_with("http://"));
        assert_eq!(config.features.log_level, "INFO");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config("upstream:\n  url: http://127.0.0.1:19001/v1/chat\n").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.server.base_path.is_empty());
        assert_eq!(config.upstream.connect_timeout_secs, 5);
        assert!(config.upstream.headers.is_empty());
        assert!(!config.upstream.use_env_proxy);
    }

    #[test]
    fn test_upstream_headers_parse() {
        let yaml = "upstream:\n  url: https://llm.internal/v1/chat\n  headers:\n    Authorization: Bearer abc\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(
            config.upstream.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[test]
    fn test_missing_upstream_is_yaml_error() {
        assert!(matches!(
            parse_config("server:\n  port: 1\n"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
