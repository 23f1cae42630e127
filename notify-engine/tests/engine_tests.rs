//! End-to-end engine scenarios with hand-written channel and store mocks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use notify_engine::Error;
use notify_engine::config::EngineConfig;
use notify_engine::database::repositories::{
    InMemoryNotificationRepository, InMemoryPreferenceStore, NotificationQuery, NotificationRepository,
    PreferenceStore,
};
use notify_engine::notification::events::{NOTIFICATION_SENT, NotificationType};
use notify_engine::notification::{
    BatchRequest, BatchTemplate, BroadcastEventSink, Channel, ChannelSender, DeliveryResult, Notification,
    NotificationEngine, NotificationPreferences, NotificationPriority, NotificationStatus, PreferenceUpdate,
    QuietHours, RenderedMessage, TypePreference,
};

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Transient,
    Permanent,
}

/// Channel mock recording every call.
struct RecordingChannel {
    channel: Channel,
    outcome: Outcome,
    calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl RecordingChannel {
    fn new(channel: Channel, outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            channel,
            outcome,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChannelSender for RecordingChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
        self.calls
            .lock()
            .push((recipient_id.to_string(), tokio::time::Instant::now()));
        match self.outcome {
            Outcome::Succeed => DeliveryResult::delivered(
                &message.notification_id,
                self.channel,
                Some(format!("{}-{}", self.channel, message.notification_id)),
            ),
            Outcome::Transient => DeliveryResult::failed(&message.notification_id, self.channel, "503 from provider"),
            Outcome::Permanent => {
                DeliveryResult::permanent_failure(&message.notification_id, self.channel, "destination gone")
            }
        }
    }
}

/// Preference store whose backend is down.
struct UnavailablePreferenceStore;

#[async_trait]
impl PreferenceStore for UnavailablePreferenceStore {
    async fn get(&self, _user_id: &str) -> notify_engine::Result<NotificationPreferences> {
        Err(Error::preference_store("connection refused"))
    }

    async fn update(&self, _user_id: &str, _update: PreferenceUpdate) -> notify_engine::Result<NotificationPreferences> {
        Err(Error::preference_store("connection refused"))
    }
}

struct Harness {
    engine: Arc<NotificationEngine>,
    repo: Arc<InMemoryNotificationRepository>,
    prefs: Arc<InMemoryPreferenceStore>,
}

fn harness(config: EngineConfig, senders: Vec<Arc<dyn ChannelSender>>) -> Harness {
    let repo = Arc::new(InMemoryNotificationRepository::new());
    let prefs = Arc::new(InMemoryPreferenceStore::new());
    let engine = NotificationEngine::builder(prefs.clone(), repo.clone())
        .config(config)
        .channels(senders)
        .build()
        .expect("valid engine config");
    Harness {
        engine: Arc::new(engine),
        repo,
        prefs,
    }
}

async fn status_of(repo: &InMemoryNotificationRepository, id: &str) -> NotificationStatus {
    repo.get(id).await.unwrap().expect("notification recorded").status
}

/// Quiet hours spanning the current UTC time.
fn quiet_hours_around_now() -> QuietHours {
    let now = Utc::now();
    let start = (now - chrono::Duration::hours(1)).format("%H:%M").to_string();
    let end = (now + chrono::Duration::hours(1)).format("%H:%M").to_string();
    QuietHours::new(&start, &end, "UTC").unwrap()
}

#[tokio::test]
async fn mark_as_read_is_idempotent() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);

    let n = Notification::new(NotificationType::QuestCompleted, "u1", "Quest done", "+50 XP");
    let id = n.id.clone();
    let results = h.engine.send(n).await.unwrap();
    assert!(results[0].success);
    assert_eq!(h.engine.unread_count("u1").await.unwrap(), 1);

    h.engine.mark_as_read(&id, "u1").await.unwrap();
    h.engine.mark_as_read(&id, "u1").await.unwrap();

    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Read);
    assert_eq!(h.engine.unread_count("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn mark_as_read_checks_owner_and_state() {
    let h = harness(EngineConfig::default(), vec![RecordingChannel::new(Channel::InApp, Outcome::Succeed)]);

    let n = Notification::new(NotificationType::Mention, "u1", "Mentioned", "");
    let id = n.id.clone();
    h.engine.send(n).await.unwrap();
    assert!(matches!(
        h.engine.mark_as_read(&id, "someone-else").await,
        Err(Error::NotFound { .. })
    ));

    let later = Notification::new(NotificationType::Mention, "u1", "Later", "");
    let later_id = later.id.clone();
    h.engine
        .schedule(later, Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert!(matches!(
        h.engine.mark_as_read(&later_id, "u1").await,
        Err(Error::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn quiet_hours_defer_normal_but_not_urgent() {
    let push = RecordingChannel::new(Channel::Push, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![push.clone()]);
    h.prefs.insert(
        NotificationPreferences::default_for_user("u1")
            .with_type(NotificationType::StreakReminder, TypePreference::enabled([Channel::Push]))
            .with_quiet_hours(quiet_hours_around_now()),
    );

    let before = Utc::now();
    let normal = Notification::new(NotificationType::StreakReminder, "u1", "Streak", "Day 7")
        .with_channels([Channel::Push]);
    let normal_id = normal.id.clone();
    let results = h.engine.send(normal).await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].is_scheduled());
    assert!(!results[0].success);
    assert!(results[0].error.is_none());
    let defer_until = results[0].scheduled_for.unwrap();
    assert!(defer_until > before);
    assert!(defer_until <= before + chrono::Duration::minutes(61));
    assert_eq!(status_of(&h.repo, &normal_id).await, NotificationStatus::Scheduled);
    assert_eq!(h.engine.queue().size(), 1);
    assert_eq!(push.call_count(), 0);

    let urgent = Notification::new(NotificationType::StreakReminder, "u1", "Streak lost", "")
        .with_channels([Channel::Push])
        .with_priority(NotificationPriority::Urgent);
    let results = h.engine.send(urgent).await.unwrap();

    assert!(results[0].success);
    assert_eq!(results[0].channel, Some(Channel::Push));
    assert_eq!(push.call_count(), 1);
}

#[tokio::test]
async fn in_app_survives_disabled_type() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let email = RecordingChannel::new(Channel::Email, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![in_app.clone(), email.clone()]);
    h.prefs.insert(
        NotificationPreferences::default_for_user("u1")
            .with_type(NotificationType::LevelUp, TypePreference::disabled()),
    );

    let n = Notification::new(NotificationType::LevelUp, "u1", "Level 10", "")
        .with_channels([Channel::InApp, Channel::Email]);
    let results = h.engine.send(n).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].channel, Some(Channel::InApp));
    assert_eq!(email.call_count(), 0);
}

#[tokio::test]
async fn preference_mismatch_fails_without_retry() {
    let email = RecordingChannel::new(Channel::Email, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![email.clone()]);

    let n = Notification::new(NotificationType::FriendRequest, "u1", "Friend request", "")
        .with_channels([Channel::Email]);
    let id = n.id.clone();
    let results = h.engine.send(n).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error.as_deref(), Some("no eligible channel"));
    assert!(h.engine.queue().is_empty());
    let stored = h.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("no eligible channel"));
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
    let push = RecordingChannel::new(Channel::Push, Outcome::Transient);
    let h = harness(EngineConfig::default(), vec![push.clone()]);
    h.prefs.insert(
        NotificationPreferences::default_for_user("u1")
            .with_type(NotificationType::QuestAssigned, TypePreference::enabled([Channel::Push])),
    );

    let n = Notification::new(NotificationType::QuestAssigned, "u1", "New quest", "")
        .with_channels([Channel::Push]);
    let id = n.id.clone();
    let t0: DateTime<Utc> = Utc::now();
    h.engine.schedule(n, t0).await.unwrap();

    let base = chrono::Duration::seconds(5);
    let mut now = t0;
    for attempt in 1..=2 {
        assert_eq!(h.engine.process_ready(now).await, Some(1));
        assert_eq!(push.call_count(), attempt);

        let queued = h.engine.queue().snapshot();
        assert_eq!(queued.len(), 1, "still queued after attempt {attempt}");
        assert_eq!(queued[0].attempts as usize, attempt);
        assert_eq!(queued[0].next_attempt, now + base * attempt as i32);
        assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Pending);
        now = queued[0].next_attempt;
    }

    // The third failed send is final; nothing waits in the queue afterwards.
    assert_eq!(h.engine.process_ready(now).await, Some(1));

    assert_eq!(push.call_count(), 3);
    assert!(h.engine.queue().is_empty());
    let stored = h.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert!(stored.failure_reason.unwrap().contains("503"));
    assert_eq!(h.engine.stats().failed, 1);
    assert_eq!(h.engine.stats().queue_size, 0);
}

#[tokio::test]
async fn failed_immediate_send_counts_as_first_attempt() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Transient);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);

    let n = Notification::new(NotificationType::LevelUp, "u1", "Level 3", "");
    let id = n.id.clone();
    let results = h.engine.send(n).await.unwrap();
    assert!(!results[0].success);
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Pending);

    // Drive the queue far enough into the future to exhaust every retry.
    let mut now = Utc::now();
    for _ in 0..4 {
        now += chrono::Duration::minutes(1);
        h.engine.process_ready(now).await;
    }

    assert_eq!(in_app.call_count(), 3);
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Failed);
}

#[tokio::test]
async fn cancel_after_final_attempt_is_rejected() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Transient);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);

    let n = Notification::new(NotificationType::Mention, "u2", "Ping", "");
    let id = n.id.clone();
    h.engine.send(n).await.unwrap();
    for _ in 0..2 {
        let next = h.engine.queue().next_due().expect("retry queued");
        h.engine.process_ready(next).await;
    }

    assert_eq!(in_app.call_count(), 3);
    assert!(!h.engine.queue().contains(&id));
    assert!(!h.engine.cancel(&id).await.unwrap());
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Failed);
}

#[tokio::test]
async fn scheduled_item_returns_to_pending_after_transient_failure() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Transient);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);

    let n = Notification::new(NotificationType::StreakReminder, "u1", "Streak", "");
    let id = n.id.clone();
    let at = Utc::now();
    h.engine.schedule(n, at).await.unwrap();
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Scheduled);

    h.engine.process_ready(at).await;

    assert_eq!(in_app.call_count(), 1);
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Pending);
    let queued = h.engine.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification.status, NotificationStatus::Pending);
}

#[tokio::test]
async fn permanent_channel_failure_is_not_retried() {
    let push = RecordingChannel::new(Channel::Push, Outcome::Transient);
    let sms = RecordingChannel::new(Channel::Sms, Outcome::Permanent);
    let h = harness(EngineConfig::default(), vec![push.clone(), sms.clone()]);
    h.prefs.insert(
        NotificationPreferences::default_for_user("u1")
            .with_type(NotificationType::SecurityAlert, TypePreference::enabled([Channel::Push, Channel::Sms])),
    );

    let n = Notification::new(NotificationType::SecurityAlert, "u1", "New login", "")
        .with_channels([Channel::Push, Channel::Sms])
        .with_priority(NotificationPriority::Urgent);
    h.engine.send(n).await.unwrap();

    let queued = h.engine.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].excluded_channels.contains(&Channel::Sms));

    h.engine.process_ready(queued[0].next_attempt).await;

    assert_eq!(push.call_count(), 2);
    assert_eq!(sms.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_is_chunked_with_pacing() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let config = EngineConfig {
        batch_size: 50,
        batch_delay_ms: 100,
        ..Default::default()
    };
    let h = harness(config, vec![in_app.clone()]);

    let recipients: Vec<String> = (0..120).map(|i| format!("user-{i}")).collect();
    let batch = BatchRequest::new(
        recipients,
        NotificationType::SystemAnnouncement,
        BatchTemplate::new("Maintenance", "Hi {{recipient_id}}, we are down at {{time}}"),
    )
    .with_data(
        serde_json::json!({"time": "02:00 UTC"})
            .as_object()
            .cloned()
            .unwrap(),
    );

    let results = h.engine.send_batch(batch).await;

    assert_eq!(results.len(), 120);
    assert!(results.iter().all(|r| r.success));

    let mut instants: Vec<tokio::time::Instant> = in_app.calls.lock().iter().map(|(_, at)| *at).collect();
    instants.sort();
    let mut chunks: Vec<(tokio::time::Instant, usize)> = Vec::new();
    for at in instants {
        match chunks.last_mut() {
            Some((start, count)) if *start == at => *count += 1,
            _ => chunks.push((at, 1)),
        }
    }
    let sizes: Vec<usize> = chunks.iter().map(|(_, n)| *n).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    for pair in chunks.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(100));
    }

    let inbox = h
        .engine
        .notifications_for_user("user-7", &NotificationQuery::default())
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].body, "Hi user-7, we are down at 02:00 UTC");
}

#[tokio::test]
async fn badge_earned_respects_per_type_channels() {
    let push = RecordingChannel::new(Channel::Push, Outcome::Succeed);
    let email = RecordingChannel::new(Channel::Email, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![push.clone(), email.clone()]);
    h.prefs
        .update(
            "u1",
            PreferenceUpdate {
                per_type: BTreeMap::from([(
                    NotificationType::BadgeEarned,
                    TypePreference::enabled([Channel::Push]),
                )]),
                global: None,
            },
        )
        .await
        .unwrap();

    let n = Notification::new(
        "badge_earned".parse().unwrap(),
        "u1",
        "Badge earned",
        "You earned Early Bird",
    )
    .with_channels([Channel::Push, Channel::Email])
    .with_priority(NotificationPriority::Normal);
    let results = h.engine.send(n).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].channel, Some(Channel::Push));
    assert_eq!(email.call_count(), 0);
}

#[tokio::test]
async fn unavailable_preference_store_is_a_hard_error() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let repo = Arc::new(InMemoryNotificationRepository::new());
    let engine = NotificationEngine::builder(Arc::new(UnavailablePreferenceStore), repo.clone())
        .channel(in_app.clone())
        .build()
        .unwrap();

    let n = Notification::new(NotificationType::LevelUp, "u1", "Level 4", "");
    let id = n.id.clone();
    let err = engine.send(n).await.unwrap_err();

    assert!(matches!(err, Error::PreferenceStore(_)));
    assert_eq!(in_app.call_count(), 0);
    assert_eq!(status_of(&repo, &id).await, NotificationStatus::Pending);
}

#[tokio::test]
async fn future_scheduled_for_is_queued() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);
    let at = Utc::now() + chrono::Duration::minutes(30);

    let n = Notification::new(NotificationType::StreakReminder, "u1", "Keep going", "").scheduled_for(at);
    let id = n.id.clone();
    let results = h.engine.send(n).await.unwrap();

    assert_eq!(results[0].scheduled_for, Some(at));
    assert_eq!(in_app.call_count(), 0);
    assert_eq!(h.engine.process_ready(at - chrono::Duration::seconds(1)).await, Some(0));
    assert_eq!(h.engine.process_ready(at).await, Some(1));
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Sent);
}

#[tokio::test]
async fn double_schedule_keeps_both_entries() {
    let in_app = RecordingChannel::new(Channel::InApp, Outcome::Succeed);
    let h = harness(EngineConfig::default(), vec![in_app.clone()]);
    let n = Notification::new(NotificationType::StreakReminder, "u1", "Reminder", "");
    let id = n.id.clone();
    let now = Utc::now();

    h.engine.schedule(n.clone(), now).await.unwrap();
    h.engine.schedule(n, now + chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(h.engine.queue().size(), 2);

    assert!(h.engine.cancel(&id).await.unwrap());
    assert!(h.engine.queue().is_empty());
    assert_eq!(status_of(&h.repo, &id).await, NotificationStatus::Cancelled);
}

#[tokio::test]
async fn sent_event_carries_channel_results() {
    let events = Arc::new(BroadcastEventSink::default());
    let mut rx = events.subscribe();
    let repo = Arc::new(InMemoryNotificationRepository::new());
    let engine = NotificationEngine::builder(Arc::new(InMemoryPreferenceStore::new()), repo)
        .channel(RecordingChannel::new(Channel::InApp, Outcome::Succeed))
        .event_sink(events)
        .build()
        .unwrap();

    let n = Notification::new(NotificationType::BadgeEarned, "u1", "Badge", "");
    let id = n.id.clone();
    engine.send(n).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.name, NOTIFICATION_SENT);
    assert_eq!(event.payload["id"], id.as_str());
    assert_eq!(event.payload["type"], "badge_earned");
    assert_eq!(event.payload["status"], "sent");
    assert_eq!(event.payload["results"][0]["channel"], "in_app");
}

#[tokio::test]
async fn mark_all_as_read_clears_unread() {
    let h = harness(EngineConfig::default(), vec![RecordingChannel::new(Channel::InApp, Outcome::Succeed)]);
    for title in ["One", "Two", "Three"] {
        h.engine
            .send(Notification::new(NotificationType::Mention, "u1", title, ""))
            .await
            .unwrap();
    }

    assert_eq!(h.engine.unread_count("u1").await.unwrap(), 3);
    assert_eq!(h.engine.mark_all_as_read("u1").await.unwrap(), 3);
    assert_eq!(h.engine.unread_count("u1").await.unwrap(), 0);

    let read = h
        .engine
        .notifications_for_user("u1", &NotificationQuery::default().with_status(NotificationStatus::Read))
        .await
        .unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[0].title, "Three");
}
