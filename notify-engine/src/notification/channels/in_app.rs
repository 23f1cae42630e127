//! In-app notification channel.
//!
//! The stored notification record is the in-app "inbox", so delivery always
//! succeeds. Recipients that are connected right now additionally receive
//! the message through a per-recipient broadcast subscription; that push is
//! best effort and never affects the delivery result.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::ChannelSender;
use crate::notification::types::{Channel, DeliveryResult, RenderedMessage};

/// Per-recipient buffer for real-time subscribers.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// In-app channel with real-time fan-out.
pub struct InAppChannel {
    subscribers: DashMap<String, broadcast::Sender<RenderedMessage>>,
    capacity: usize,
}

impl InAppChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Receive in-app messages for `recipient_id` while the receiver lives.
    pub fn subscribe(&self, recipient_id: &str) -> broadcast::Receiver<RenderedMessage> {
        self.prune();
        self.subscribers
            .entry(recipient_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Whether `recipient_id` currently has a live subscriber.
    pub fn is_connected(&self, recipient_id: &str) -> bool {
        let connected = self
            .subscribers
            .get(recipient_id)
            .is_some_and(|tx| tx.receiver_count() > 0);
        if !connected {
            self.subscribers
                .remove_if(recipient_id, |_, tx| tx.receiver_count() == 0);
        }
        connected
    }

    /// Forget recipients whose receivers have all been dropped.
    ///
    /// Returns how many entries were removed.
    pub fn prune(&self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, tx| tx.receiver_count() > 0);
        let removed = before.saturating_sub(self.subscribers.len());
        if removed > 0 {
            trace!(removed, "Pruned stale in-app subscriptions");
        }
        removed
    }

    fn publish(&self, recipient_id: &str, message: &RenderedMessage) {
        let Some(tx) = self.subscribers.get(recipient_id) else {
            return;
        };

        if tx.send(message.clone()).is_err() {
            // Every receiver is gone; forget the recipient.
            drop(tx);
            self.subscribers
                .remove_if(recipient_id, |_, tx| tx.receiver_count() == 0);
            trace!(recipient_id, "Dropped stale in-app subscription");
        }
    }
}

impl Default for InAppChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSender for InAppChannel {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
        self.publish(recipient_id, message);
        DeliveryResult::delivered(
            &message.notification_id,
            Channel::InApp,
            Some(message.notification_id.clone()),
        )
    }
}
