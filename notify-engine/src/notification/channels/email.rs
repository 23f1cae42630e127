//! Email notification channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ChannelSender, MessageTransport, transport_outcome};
use crate::notification::types::{Channel, DeliveryResult, NotificationPriority, RenderedMessage};

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Prepended to every subject line.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_subject_prefix() -> String {
    "[Quest]".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Email notification channel.
pub struct EmailChannel {
    config: EmailConfig,
    transport: Option<Arc<dyn MessageTransport>>,
}

impl EmailChannel {
    /// Create a new email channel. Without a transport the channel is unconfigured.
    pub fn new(config: EmailConfig, transport: Option<Arc<dyn MessageTransport>>) -> Self {
        Self { config, transport }
    }

    fn build_subject(&self, message: &RenderedMessage) -> String {
        if self.config.subject_prefix.is_empty() {
            message.title.clone()
        } else {
            format!("{} {}", self.config.subject_prefix, message.title)
        }
    }

    fn build_body_text(&self, message: &RenderedMessage) -> String {
        format!(
            "{}\n\n{}\n\nType: {}\nTime: {}",
            message.title,
            message.body,
            message.notification_type.label(),
            message.created_at.to_rfc3339()
        )
    }

    fn build_body_html(&self, message: &RenderedMessage) -> String {
        let accent = match message.priority {
            NotificationPriority::Low => "#808080",
            NotificationPriority::Normal => "#3498db",
            NotificationPriority::High => "#f39c12",
            NotificationPriority::Urgent => "#e74c3c",
        };

        format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; margin: 20px;">
    <div style="background-color: {}; color: white; padding: 15px; border-radius: 5px;">
        <h2>{}</h2>
    </div>
    <div style="padding: 20px; background-color: #f9f9f9; border-radius: 5px; margin-top: 10px;">
        <p>{}</p>
    </div>
    <div style="color: #666; font-size: 12px; margin-top: 20px;">
        <p>{} | {}</p>
    </div>
</body>
</html>"#,
            accent,
            escape_html(&message.title),
            escape_html(&message.body),
            message.notification_type.label(),
            message.created_at.to_rfc3339()
        )
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl ChannelSender for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn is_configured(&self) -> bool {
        self.config.enabled && self.transport.as_ref().is_some_and(|t| t.is_configured())
    }

    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
        let Some(transport) = self.transport.as_ref().filter(|_| self.is_configured()) else {
            debug!(notification_id = %message.notification_id, "Email channel not configured");
            return DeliveryResult::not_configured(&message.notification_id, Channel::Email);
        };

        let payload = json!({
            "subject": self.build_subject(message),
            "text": self.build_body_text(message),
            "html": self.build_body_html(message),
            "data": message.data,
        });

        let outcome = transport.deliver(Channel::Email, recipient_id, &payload).await;
        transport_outcome(Channel::Email, &message.notification_id, outcome)
    }
}
