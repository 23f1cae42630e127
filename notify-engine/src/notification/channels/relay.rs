//! HTTP relay transport.
//!
//! Posts formatted channel payloads to an external relay service that owns
//! the provider integration (SMTP, Web Push, SMS gateway). Response codes map
//! onto [`TransportError`] classes:
//!
//! | Response                    | Outcome     |
//! |-----------------------------|-------------|
//! | 2xx                         | delivered   |
//! | 404 / 410 / other 4xx       | permanent   |
//! | 408 / 429 / 5xx / I/O error | transient   |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{MessageTransport, TransportError, truncate_chars};
use crate::notification::types::Channel;

fn default_timeout() -> u64 {
    30
}

/// Relay endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Endpoint receiving `POST` requests.
    pub url: String,
    /// Optional bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// [`MessageTransport`] backed by a JSON-over-HTTP relay.
pub struct HttpRelayTransport {
    config: RelayConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default, alias = "message_id")]
    id: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Classify a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let detail = format!("relay returned {}: {}", status, truncate_chars(body, 200));
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => TransportError::Transient(detail),
        s if s.is_server_error() => TransportError::Transient(detail),
        _ => TransportError::Permanent(detail),
    }
}

#[async_trait]
impl MessageTransport for HttpRelayTransport {
    fn is_configured(&self) -> bool {
        !self.config.url.trim().is_empty()
    }

    async fn deliver(
        &self,
        channel: Channel,
        recipient_id: &str,
        payload: &Value,
    ) -> Result<Option<String>, TransportError> {
        if !self.is_configured() {
            return Err(TransportError::NotConfigured);
        }

        let body = json!({
            "channel": channel,
            "recipient_id": recipient_id,
            "payload": payload,
        });

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(%channel, error = %e, "Relay request failed");
            TransportError::Transient(format!("relay request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        // A missing or non-JSON body still counts as delivered.
        let message_id = response
            .json::<RelayResponse>()
            .await
            .ok()
            .and_then(|r| r.id);
        debug!(%channel, recipient_id, ?message_id, "Relay accepted message");
        Ok(message_id)
    }
}
