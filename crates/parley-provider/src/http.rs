use reqwest::Client;
use std::time::Duration;

use crate::ProviderError;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";

/// Shared client honoring the configured proxy. `timeout` bounds the whole
/// request; streaming clients pass `None`.
pub fn build_client(proxy: Option<&str>, timeout: Option<Duration>) -> Result<Client, ProviderError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10));

    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| ProviderError::ConfigError(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| ProviderError::ConfigError(e.to_string()))
}
