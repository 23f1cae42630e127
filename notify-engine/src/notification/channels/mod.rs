//! Delivery channels.
//!
//! Each [`Channel`] is served by one [`ChannelSender`]:
//! - In-app (system of record, real-time fan-out to connected subscribers)
//! - Email
//! - Push
//! - SMS
//!
//! Email, push and SMS reformat the message and hand it to a
//! [`MessageTransport`]; the transport owns provider details.

mod email;
mod in_app;
mod push;
mod relay;
mod sms;

pub use email::{EmailChannel, EmailConfig};
pub use in_app::InAppChannel;
pub use push::{PushChannel, PushConfig};
pub use relay::{HttpRelayTransport, RelayConfig};
pub use sms::{SmsChannel, SmsConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::types::{Channel, DeliveryResult, RenderedMessage};
use crate::config::ChannelsConfig;

/// Sends one rendered notification over one channel.
///
/// Implementations never fail with an error: every outcome, including
/// "not configured", is a [`DeliveryResult`].
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// The channel this sender serves.
    fn channel(&self) -> Channel;

    /// Whether the sender can deliver at all.
    fn is_configured(&self) -> bool;

    /// Deliver `message` to `recipient_id`.
    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult;
}

/// Failure classes reported by a [`MessageTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not configured")]
    NotConfigured,

    /// Timeouts, connection failures, 5xx-equivalents. Worth retrying.
    #[error("transient delivery error: {0}")]
    Transient(String),

    /// Invalid or expired destination. Retrying cannot succeed.
    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }
}

/// Outbound transport for a formatted channel payload.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    /// Deliver `payload`, returning the provider's message id when known.
    async fn deliver(
        &self,
        channel: Channel,
        recipient_id: &str,
        payload: &Value,
    ) -> std::result::Result<Option<String>, TransportError>;
}

/// Build one sender per channel from configuration.
///
/// Email, push and SMS get an [`HttpRelayTransport`] when a relay endpoint
/// is configured and stay unconfigured otherwise.
pub fn build_senders(config: &ChannelsConfig, in_app: Arc<InAppChannel>) -> Vec<Arc<dyn ChannelSender>> {
    let relay = |relay: &Option<RelayConfig>| -> Option<Arc<dyn MessageTransport>> {
        relay
            .clone()
            .map(|c| Arc::new(HttpRelayTransport::new(c)) as Arc<dyn MessageTransport>)
    };

    vec![
        in_app as Arc<dyn ChannelSender>,
        Arc::new(EmailChannel::new(config.email.clone(), relay(&config.email_relay))),
        Arc::new(PushChannel::new(config.push.clone(), relay(&config.push_relay))),
        Arc::new(SmsChannel::new(config.sms.clone(), relay(&config.sms_relay))),
    ]
}

/// Convert a transport outcome into a [`DeliveryResult`].
pub(crate) fn transport_outcome(
    channel: Channel,
    notification_id: &str,
    outcome: std::result::Result<Option<String>, TransportError>,
) -> DeliveryResult {
    match outcome {
        Ok(message_id) => {
            debug!(%channel, notification_id, "Notification delivered");
            DeliveryResult::delivered(notification_id, channel, message_id)
        }
        Err(TransportError::NotConfigured) => DeliveryResult::not_configured(notification_id, channel),
        Err(e) if e.is_permanent() => {
            DeliveryResult::permanent_failure(notification_id, channel, e.to_string())
        }
        Err(e) => DeliveryResult::failed(notification_id, channel, e.to_string()),
    }
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut.
pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let mut iter = input.chars();
    let mut out: String = iter.by_ref().take(max_chars).collect();
    if iter.next().is_some() {
        out.pop();
        out.push('…');
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::types::CHANNEL_NOT_CONFIGURED;

    #[test]
    fn transport_errors_classify() {
        assert!(TransportError::Permanent("gone".into()).is_permanent());
        assert!(TransportError::NotConfigured.is_permanent());
        assert!(!TransportError::Transient("timeout".into()).is_permanent());
    }

    #[test]
    fn outcome_mapping() {
        let ok = transport_outcome(Channel::Push, "n1", Ok(Some("m1".into())));
        assert!(ok.success);
        assert_eq!(ok.message_id.as_deref(), Some("m1"));

        let transient = transport_outcome(Channel::Push, "n1", Err(TransportError::Transient("503".into())));
        assert!(!transient.success);
        assert!(!transient.permanent);

        let permanent = transport_outcome(Channel::Push, "n1", Err(TransportError::Permanent("410".into())));
        assert!(permanent.permanent);

        let unconfigured = transport_outcome(Channel::Sms, "n1", Err(TransportError::NotConfigured));
        assert_eq!(unconfigured.error.as_deref(), Some(CHANNEL_NOT_CONFIGURED));
    }

    #[test]
    fn senders_without_relays_are_unconfigured() {
        let mut config = ChannelsConfig::default();
        config.push_relay = Some(RelayConfig::new("https://relay.local/push"));

        let senders = build_senders(&config, Arc::new(InAppChannel::new()));

        let configured: Vec<_> = senders
            .iter()
            .filter(|s| s.is_configured())
            .map(|s| s.channel())
            .collect();
        assert_eq!(senders.len(), 4);
        assert_eq!(configured, vec![Channel::InApp, Channel::Push]);
    }

    #[test]
    fn truncate_keeps_short_input() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hell…");
        assert_eq!(truncate_chars("héllo wörld", 4).chars().count(), 4);
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
