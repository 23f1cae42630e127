//! Notification delivery.
//!
//! Accepts notification requests, filters them against per-user preferences
//! and quiet hours, fans out to the requested channels, and retries failed
//! deliveries from a priority-ordered queue.
//!
//! # Features
//!
//! - In-app, email, push and SMS channels
//! - Per-type channel preferences, global disable, do-not-disturb
//! - Quiet hours in the recipient's timezone (urgent notifications bypass)
//! - Retry queue with linear backoff and permanent-failure short-circuit
//! - Chunked batch sends with pacing between chunks
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use notify_engine::database::repositories::{InMemoryNotificationRepository, InMemoryPreferenceStore};
//! use notify_engine::notification::{InAppChannel, Notification, NotificationEngine, NotificationType};
//!
//! let engine = Arc::new(
//!     NotificationEngine::builder(
//!         Arc::new(InMemoryPreferenceStore::new()),
//!         Arc::new(InMemoryNotificationRepository::new()),
//!     )
//!     .channel(Arc::new(InAppChannel::new()))
//!     .build()?,
//! );
//! engine.start();
//!
//! let results = engine
//!     .send(Notification::new(NotificationType::BadgeEarned, "user-1", "New badge", "Early Bird"))
//!     .await?;
//! ```

pub mod channels;
pub mod engine;
pub mod events;
pub mod filter;
pub mod preferences;
pub mod queue;
pub mod template;
pub mod types;

pub use channels::{
    ChannelSender, EmailChannel, EmailConfig, HttpRelayTransport, InAppChannel, MessageTransport, PushChannel,
    PushConfig, RelayConfig, SmsChannel, SmsConfig, TransportError, build_senders,
};
pub use engine::{BatchRequest, EngineStats, NotificationEngine, NotificationEngineBuilder};
pub use events::{BroadcastEventSink, EngineEvent, EventSink, NoopEventSink, NotificationType};
pub use filter::{DeliveryFilter, FilterDecision};
pub use preferences::{
    DeliveryFrequency, GlobalPreferences, GlobalPreferencesUpdate, NotificationPreferences, PreferenceUpdate,
    QuietHours, TypePreference,
};
pub use queue::{RetryPolicy, RetryQueue, RetryQueueItem};
pub use template::BatchTemplate;
pub use types::{
    Channel, DeliveryResult, Notification, NotificationData, NotificationPriority, NotificationStatus,
    RenderedMessage,
};
