//! Push notification channel.
//!
//! Title and body are cut down to what mobile and browser push payloads can
//! display; `data` travels through untouched for deep links.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ChannelSender, MessageTransport, transport_outcome, truncate_chars};
use crate::notification::types::{Channel, DeliveryResult, NotificationPriority, RenderedMessage};

/// Push channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub enabled: bool,
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    /// Time-to-live handed to the push service, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_max_title_chars() -> usize {
    100
}

fn default_max_body_chars() -> usize {
    300
}

fn default_ttl_secs() -> u64 {
    86_400
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_title_chars: default_max_title_chars(),
            max_body_chars: default_max_body_chars(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

/// Push notification channel.
pub struct PushChannel {
    config: PushConfig,
    transport: Option<Arc<dyn MessageTransport>>,
}

impl PushChannel {
    pub fn new(config: PushConfig, transport: Option<Arc<dyn MessageTransport>>) -> Self {
        Self { config, transport }
    }

    fn urgency(priority: NotificationPriority) -> &'static str {
        match priority {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High | NotificationPriority::Urgent => "high",
        }
    }
}

#[async_trait]
impl ChannelSender for PushChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn is_configured(&self) -> bool {
        self.config.enabled && self.transport.as_ref().is_some_and(|t| t.is_configured())
    }

    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
        let Some(transport) = self.transport.as_ref().filter(|_| self.is_configured()) else {
            debug!(notification_id = %message.notification_id, "Push channel not configured");
            return DeliveryResult::not_configured(&message.notification_id, Channel::Push);
        };

        let payload = json!({
            "title": truncate_chars(&message.title, self.config.max_title_chars),
            "body": truncate_chars(&message.body, self.config.max_body_chars),
            "tag": message.notification_type.as_str(),
            "urgency": Self::urgency(message.priority),
            "ttl": self.config.ttl_secs,
            "data": message.data,
        });

        let outcome = transport.deliver(Channel::Push, recipient_id, &payload).await;
        transport_outcome(Channel::Push, &message.notification_id, outcome)
    }
}
