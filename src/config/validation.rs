use http::{HeaderName, HeaderValue};

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.max_body_bytes == 0 {
        return Err(validation_err("server.max_body_bytes must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(listener_count) = server.tcp_reuse_port_listener_count {
        if listener_count == 0 {
            return Err(validation_err(
                "server.tcp_reuse_port_listener_count must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if !upstream.url.starts_with("http://") && !upstream.url.starts_with("https://") {
        return Err(validation_err(
            "upstream.url must start with http:// or https://",
        ));
    }
    url::Url::parse(&upstream.url)
        .map_err(|e| validation_err(format!("upstream.url is not a valid URL: {e}")))?;

    if let Some(proxy) = upstream.proxy.as_deref() {
        let parsed = url::Url::parse(proxy)
            .map_err(|e| validation_err(format!("upstream.proxy is not a valid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(validation_err(format!(
                "upstream.proxy has unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
    }

    for (name, value) in &upstream.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| validation_err(format!("upstream.headers: invalid header name '{name}'")))?;
        HeaderValue::from_str(value).map_err(|_| {
            validation_err(format!("upstream.headers: invalid value for header '{name}'"))
        })?;
    }

    if upstream.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "upstream.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if upstream.connect_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.connect_timeout_secs must be greater than 0",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL", "TRACE", "DISABLED",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is not one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
