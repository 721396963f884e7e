use std::sync::Once;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::UpstreamConfig;
use crate::error::StreamError;

static RUSTLS_PROVIDER_INIT: Once = Once::new();

/// Build the HTTP client used for upstream streaming calls.
///
/// No overall request timeout is configured: a completion stream may stay
/// open for as long as the model keeps producing, and the request's
/// cancellation token is what ends it early.
///
/// # Errors
///
/// Returns [`StreamError::Transport`] when the proxy URL is invalid or the
/// client cannot be built.
pub fn build_upstream_client(config: &UpstreamConfig) -> Result<reqwest::Client, StreamError> {
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let pool_idle_timeout = if config.pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.pool_idle_timeout_secs))
    };

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| StreamError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| StreamError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Convert configured extra headers into a header map.
///
/// # Errors
///
/// Returns [`StreamError::Transport`] for a name or value that is not a
/// legal HTTP header.
pub fn build_extra_headers<'a, I>(headers: I) -> Result<HeaderMap, StreamError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StreamError::Transport(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StreamError::Transport(format!("Invalid value for header '{name}': {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}
