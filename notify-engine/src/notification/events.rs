//! Notification types and engine observability events.
//!
//! [`NotificationType`] is the category used to look up per-type
//! preferences. [`EngineEvent`]s are emitted through an [`EventSink`] after
//! state changes; sinks are fire-and-forget and must never block the engine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Static metadata about a supported notification type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NotificationTypeInfo {
    pub notification_type: NotificationType,
    /// Canonical key (snake_case).
    pub key: &'static str,
    /// Human-friendly label.
    pub label: &'static str,
    /// Additional accepted spellings (legacy / aliases).
    pub aliases: &'static [&'static str],
}

/// Category of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    QuestCompleted,
    QuestAssigned,
    BadgeEarned,
    LevelUp,
    StreakReminder,
    StreakBroken,
    FriendRequest,
    Mention,
    SystemAnnouncement,
    SecurityAlert,
}

const NOTIFICATION_TYPES: &[NotificationTypeInfo] = &[
    NotificationTypeInfo {
        notification_type: NotificationType::QuestCompleted,
        key: "quest_completed",
        label: "Quest Completed",
        aliases: &["quest.completed", "quest-completed", "QuestCompleted"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::QuestAssigned,
        key: "quest_assigned",
        label: "Quest Assigned",
        aliases: &["quest.assigned", "quest-assigned", "QuestAssigned"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::BadgeEarned,
        key: "badge_earned",
        label: "Badge Earned",
        aliases: &["badge.earned", "badge-earned", "BadgeEarned"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::LevelUp,
        key: "level_up",
        label: "Level Up",
        aliases: &["level.up", "level-up", "LevelUp"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::StreakReminder,
        key: "streak_reminder",
        label: "Streak Reminder",
        aliases: &["streak.reminder", "streak-reminder", "StreakReminder"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::StreakBroken,
        key: "streak_broken",
        label: "Streak Broken",
        aliases: &["streak.broken", "streak-broken", "StreakBroken"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::FriendRequest,
        key: "friend_request",
        label: "Friend Request",
        aliases: &["friend.request", "friend-request", "FriendRequest"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::Mention,
        key: "mention",
        label: "Mention",
        aliases: &["user.mentioned", "Mention"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::SystemAnnouncement,
        key: "system_announcement",
        label: "System Announcement",
        aliases: &["system.announcement", "announcement", "SystemAnnouncement"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::SecurityAlert,
        key: "security_alert",
        label: "Security Alert",
        aliases: &["security.alert", "security-alert", "SecurityAlert"],
    },
];

/// All supported notification types with their metadata.
pub fn notification_types() -> &'static [NotificationTypeInfo] {
    NOTIFICATION_TYPES
}

/// Resolve any accepted spelling to its canonical type.
pub fn canonicalize_notification_type(input: &str) -> Option<NotificationType> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized_input = normalize_type_key(trimmed);
    NOTIFICATION_TYPES
        .iter()
        .find(|info| {
            normalize_type_key(info.key) == normalized_input
                || info
                    .aliases
                    .iter()
                    .any(|alias| normalize_type_key(alias) == normalized_input)
        })
        .map(|info| info.notification_type)
}

fn normalize_type_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '.' | '-' | ' '))
        .collect()
}

impl NotificationType {
    pub fn info(self) -> &'static NotificationTypeInfo {
        NOTIFICATION_TYPES
            .iter()
            .find(|info| info.notification_type == self)
            .unwrap_or(&NOTIFICATION_TYPES[0])
    }

    /// Canonical snake_case key.
    pub fn as_str(self) -> &'static str {
        self.info().key
    }

    pub fn label(self) -> &'static str {
        self.info().label
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        canonicalize_notification_type(s)
            .ok_or_else(|| crate::Error::validation(format!("unknown notification type: {}", s)))
    }
}

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

pub const NOTIFICATION_SENT: &str = "notification_sent";
pub const NOTIFICATION_FAILED: &str = "notification_failed";
pub const NOTIFICATION_SCHEDULED: &str = "notification_scheduled";
pub const NOTIFICATION_CANCELLED: &str = "notification_cancelled";
pub const NOTIFICATION_READ: &str = "notification_read";

/// An observability event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event name, e.g. `"notification_sent"`.
    pub name: String,
    /// Free-form JSON payload carrying event-specific data.
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Fire-and-forget observability hook.
///
/// Implementations must return promptly and swallow their own failures.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Default buffer capacity for [`BroadcastEventSink`].
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
///
/// Slow subscribers observe `RecvError::Lagged`; the engine never waits.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: EngineEvent) {
        // Only fails when nobody is subscribed.
        let _ = self.sender.send(event);
    }
}
