//! Core data model for notifications and delivery outcomes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::NotificationType;
use crate::{Error, Result};

/// Opaque key/value payload handed through to channel adapters.
///
/// Keys are kept ordered; values are loosely typed JSON (string, number,
/// bool, nested map or list).
pub type NotificationData = serde_json::Map<String, Value>;

/// A delivery transport.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
    Sms,
}

/// Priority level for notifications.
///
/// Ordering follows urgency, so `Urgent > High > Normal > Low`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    /// Informational only.
    Low,
    /// Standard notifications.
    #[default]
    Normal,
    /// Important events.
    High,
    /// Requires immediate attention; bypasses quiet hours.
    Urgent,
}

impl NotificationPriority {
    /// Numeric score used for queue ordering (urgent=4 ... low=1).
    pub fn score(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Urgent => 4,
        }
    }
}

/// Lifecycle state of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Pending,
    /// Pending, but sitting in the queue with a future eligible time.
    Scheduled,
    Sent,
    Failed,
    Cancelled,
    Read,
}

impl NotificationStatus {
    /// `Pending` and its `Scheduled` sub-state.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

/// A unit of work to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: NotificationData,
    pub channels: BTreeSet<Channel>,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Reason recorded with a terminal `failed` status.
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Create a pending notification targeting the in-app channel.
    pub fn new(
        notification_type: NotificationType,
        recipient_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            notification_type,
            recipient_id: recipient_id.into(),
            title: title.into(),
            body: body.into(),
            data: NotificationData::new(),
            channels: BTreeSet::from([Channel::InApp]),
            priority: NotificationPriority::Normal,
            status: NotificationStatus::Pending,
            scheduled_for: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            read_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: NotificationData) -> Self {
        self.data = data;
        self
    }

    pub fn with_data_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Reject notifications that can never be delivered.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::validation(format!(
                "notification {} requests no channels",
                self.id
            )));
        }
        if self.recipient_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "notification {} has no recipient",
                self.id
            )));
        }
        Ok(())
    }

    /// Move to `status`, stamping `updated_at` (and `read_at` for reads).
    pub fn set_status(&mut self, status: NotificationStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        if status == NotificationStatus::Read && self.read_at.is_none() {
            self.read_at = Some(at);
        }
    }

    pub fn requested(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }
}

/// Channel-agnostic content handed to a [`ChannelSender`](super::channels::ChannelSender).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub notification_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

impl From<&Notification> for RenderedMessage {
    fn from(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id.clone(),
            notification_type: notification.notification_type,
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: notification.data.clone(),
            priority: notification.priority,
            created_at: notification.created_at,
        }
    }
}

/// Outcome of one delivery attempt on one channel.
///
/// Engine-level outcomes that did not touch a channel (deferral, "no eligible
/// channel") carry `channel: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub notification_id: String,
    pub channel: Option<Channel>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retrying cannot fix this failure (dead destination, not configured).
    #[serde(default)]
    pub permanent: bool,
    /// Set when the notification was deferred instead of sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Error text for adapters that are not configured or not enabled.
pub const CHANNEL_NOT_CONFIGURED: &str = "channel not configured";

/// Error text when preference filtering leaves nothing to send to.
pub const NO_ELIGIBLE_CHANNEL: &str = "no eligible channel";

impl DeliveryResult {
    pub fn delivered(
        notification_id: impl Into<String>,
        channel: Channel,
        message_id: Option<String>,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel: Some(channel),
            success: true,
            message_id,
            error: None,
            permanent: false,
            scheduled_for: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        notification_id: impl Into<String>,
        channel: Channel,
        error: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel: Some(channel),
            success: false,
            message_id: None,
            error: Some(error.into()),
            permanent: false,
            scheduled_for: None,
            timestamp: Utc::now(),
        }
    }

    /// A failure that must not be retried on this channel.
    pub fn permanent_failure(
        notification_id: impl Into<String>,
        channel: Channel,
        error: impl Into<String>,
    ) -> Self {
        Self {
            permanent: true,
            ..Self::failed(notification_id, channel, error)
        }
    }

    pub fn not_configured(notification_id: impl Into<String>, channel: Channel) -> Self {
        Self::permanent_failure(notification_id, channel, CHANNEL_NOT_CONFIGURED)
    }

    /// Synthetic result for a notification with nothing left to deliver to.
    pub fn no_eligible_channel(notification_id: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel: None,
            success: false,
            message_id: None,
            error: Some(NO_ELIGIBLE_CHANNEL.to_string()),
            permanent: true,
            scheduled_for: None,
            timestamp: Utc::now(),
        }
    }

    /// Synthetic result for a deferred notification. Not a failure.
    pub fn scheduled(notification_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel: None,
            success: false,
            message_id: None,
            error: None,
            permanent: false,
            scheduled_for: Some(at),
            timestamp: Utc::now(),
        }
    }

    /// Batch placeholder for a recipient whose send errored before fan-out.
    pub fn engine_error(notification_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel: None,
            success: false,
            message_id: None,
            error: Some(error.into()),
            permanent: false,
            scheduled_for: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_for.is_some()
    }
}
