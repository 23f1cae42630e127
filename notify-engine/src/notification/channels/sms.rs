//! SMS notification channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ChannelSender, MessageTransport, transport_outcome, truncate_chars};
use crate::notification::types::{Channel, DeliveryResult, RenderedMessage};

/// Characters in a single GSM-7 segment.
const SINGLE_SEGMENT_CHARS: usize = 160;

/// SMS channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub enabled: bool,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Alphanumeric sender shown on the handset.
    #[serde(default)]
    pub sender_id: Option<String>,
}

fn default_max_chars() -> usize {
    SINGLE_SEGMENT_CHARS
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: SINGLE_SEGMENT_CHARS,
            sender_id: None,
        }
    }
}

/// SMS notification channel.
pub struct SmsChannel {
    config: SmsConfig,
    transport: Option<Arc<dyn MessageTransport>>,
}

impl SmsChannel {
    pub fn new(config: SmsConfig, transport: Option<Arc<dyn MessageTransport>>) -> Self {
        Self { config, transport }
    }

    fn build_text(&self, message: &RenderedMessage) -> String {
        let text = if message.body.is_empty() {
            message.title.clone()
        } else {
            format!("{}: {}", message.title, message.body)
        };
        truncate_chars(&text, self.config.max_chars)
    }
}

#[async_trait]
impl ChannelSender for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn is_configured(&self) -> bool {
        self.config.enabled && self.transport.as_ref().is_some_and(|t| t.is_configured())
    }

    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
        let Some(transport) = self.transport.as_ref().filter(|_| self.is_configured()) else {
            debug!(notification_id = %message.notification_id, "SMS channel not configured");
            return DeliveryResult::not_configured(&message.notification_id, Channel::Sms);
        };

        let payload = json!({
            "text": self.build_text(message),
            "sender_id": self.config.sender_id,
        });

        let outcome = transport.deliver(Channel::Sms, recipient_id, &payload).await;
        transport_outcome(Channel::Sms, &message.notification_id, outcome)
    }
}
