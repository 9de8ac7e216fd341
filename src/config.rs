//! Remote configuration retrieval.
//!
//! The broker address can be served by a remote endpoint so deployments can
//! repoint clients without a release. Fetching is best-effort: a bounded
//! number of fixed-interval attempts, then a fallback to the local default
//! so degraded and offline-dev environments still start.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;

use crate::error::ConfigError;
use crate::events::{ClientEvent, EventBus};
use crate::types::DEFAULT_BROKER_URL;

/// Payload of the remote configuration endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub broker_url: Option<String>,
}

/// Where the client fetches its remote configuration from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<RemoteConfig, ConfigError>;
}

/// Resolve the broker URL before the first connect.
///
/// A config that explicitly omits the URL means "use the default" and is not
/// retried. Fetch failures are retried `attempts` times with fixed spacing;
/// exhaustion emits a `ConfigFallback` warning and returns the default.
pub(crate) async fn resolve_broker_url(
    source: Option<&Arc<dyn ConfigSource>>,
    attempts: u32,
    retry_delay: Duration,
    events: &EventBus,
) -> String {
    let Some(source) = source else {
        return DEFAULT_BROKER_URL.to_string();
    };

    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match source.fetch().await {
            Ok(config) => {
                return config
                    .broker_url
                    .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
            }
            Err(err) => last_error = err.to_string(),
        }

        if attempt < attempts {
            sleep(retry_delay).await;
        }
    }

    events.emit(ClientEvent::ConfigFallback { reason: last_error });
    DEFAULT_BROKER_URL.to_string()
}

/// `ConfigSource` backed by an HTTP endpoint returning [`RemoteConfig`] as
/// JSON. The tenant key is sent in the `x-project-id` header.
#[cfg(feature = "http")]
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[cfg(feature = "http")]
impl HttpConfigSource {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<RemoteConfig, ConfigError> {
        let response = self
            .client
            .get(&self.url)
            .header("x-project-id", &self.api_key)
            .send()
            .await
            .map_err(|err| ConfigError(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ConfigError(format!("status {}", response.status())));
        }

        response
            .json::<RemoteConfig>()
            .await
            .map_err(|err| ConfigError(err.to_string()))
    }
}
