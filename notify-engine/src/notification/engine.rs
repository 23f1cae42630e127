//! Notification engine.
//!
//! Orchestrates single sends, batch sends, scheduling, cancellation and the
//! background queue processor. Everything it talks to is injected: the
//! preference store, the notification repository, one [`ChannelSender`] per
//! channel and an [`EventSink`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::ChannelSender;
use super::events::{
    EngineEvent, EventSink, NOTIFICATION_CANCELLED, NOTIFICATION_FAILED, NOTIFICATION_READ,
    NOTIFICATION_SCHEDULED, NOTIFICATION_SENT, NoopEventSink, NotificationType,
};
use super::filter::DeliveryFilter;
use super::queue::{RetryPolicy, RetryQueue, RetryQueueItem};
use super::template::BatchTemplate;
use super::types::{
    Channel, DeliveryResult, NO_ELIGIBLE_CHANNEL, Notification, NotificationData, NotificationPriority,
    NotificationStatus, RenderedMessage,
};
use crate::config::EngineConfig;
use crate::database::repositories::{NotificationQuery, NotificationRepository, PreferenceStore};
use crate::{Error, Result};

/// A templated notification for many recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub recipient_ids: Vec<String>,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub template: BatchTemplate,
    #[serde(default)]
    pub data: NotificationData,
    #[serde(default = "default_batch_channels")]
    pub channels: BTreeSet<Channel>,
    #[serde(default)]
    pub priority: NotificationPriority,
}

fn default_batch_channels() -> BTreeSet<Channel> {
    BTreeSet::from([Channel::InApp])
}

impl BatchRequest {
    pub fn new(
        recipient_ids: impl IntoIterator<Item = impl Into<String>>,
        notification_type: NotificationType,
        template: BatchTemplate,
    ) -> Self {
        Self {
            recipient_ids: recipient_ids.into_iter().map(Into::into).collect(),
            notification_type,
            template,
            data: NotificationData::new(),
            channels: default_batch_channels(),
            priority: NotificationPriority::Normal,
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_data(mut self, data: NotificationData) -> Self {
        self.data = data;
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The notification sent to `recipient_id`.
    pub fn notification_for(&self, recipient_id: &str) -> Notification {
        let (title, body) = self.template.render(recipient_id, &self.data);
        Notification::new(self.notification_type, recipient_id, title, body)
            .with_data(self.data.clone())
            .with_channels(self.channels.iter().copied())
            .with_priority(self.priority)
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Items waiting in the retry queue.
    pub queue_size: usize,
    pub next_due: Option<DateTime<Utc>>,
    pub sent: u64,
    pub failed: u64,
    /// Failed attempts that were queued for another try.
    pub retried: u64,
    pub scheduled: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    scheduled: AtomicU64,
    cancelled: AtomicU64,
}

/// How a set of channel results settles a delivery attempt.
enum Settlement {
    Sent,
    /// Nothing succeeded but some failure was transient.
    Retry {
        permanent: BTreeSet<Channel>,
        error: String,
    },
    Failed(String),
}

fn settle(results: &[DeliveryResult]) -> Settlement {
    if results.iter().any(|r| r.success) {
        return Settlement::Sent;
    }

    let error = results
        .iter()
        .map(|r| match (r.channel, r.error.as_deref()) {
            (Some(channel), Some(e)) => format!("{}: {}", channel, e),
            (None, Some(e)) => e.to_string(),
            (Some(channel), None) => format!("{}: unknown error", channel),
            (None, None) => "unknown error".to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");

    if results.iter().any(|r| !r.permanent) {
        Settlement::Retry {
            permanent: results
                .iter()
                .filter(|r| r.permanent)
                .filter_map(|r| r.channel)
                .collect(),
            error,
        }
    } else {
        Settlement::Failed(error)
    }
}

/// Resets the processing flag when a pass ends, including on panic.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builder for [`NotificationEngine`].
pub struct NotificationEngineBuilder {
    config: EngineConfig,
    preferences: Arc<dyn PreferenceStore>,
    repository: Arc<dyn NotificationRepository>,
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    events: Option<Arc<dyn EventSink>>,
}

impl NotificationEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the sender for its channel, replacing any earlier one.
    pub fn channel(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn channels(mut self, senders: impl IntoIterator<Item = Arc<dyn ChannelSender>>) -> Self {
        for sender in senders {
            self.senders.insert(sender.channel(), sender);
        }
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<NotificationEngine> {
        self.config.validate()?;

        for (channel, sender) in &self.senders {
            if !sender.is_configured() {
                warn!(%channel, "Channel registered but not configured");
            }
        }

        Ok(NotificationEngine {
            retry_policy: self.config.retry_policy(),
            config: self.config,
            preferences: self.preferences,
            repository: self.repository,
            senders: self.senders,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventSink)),
            filter: DeliveryFilter::new(),
            queue: RetryQueue::new(),
            processing: AtomicBool::new(false),
            counters: EngineCounters::default(),
            cancellation_token: CancellationToken::new(),
            processor: Mutex::new(None),
        })
    }
}

/// The notification engine.
pub struct NotificationEngine {
    config: EngineConfig,
    retry_policy: RetryPolicy,
    preferences: Arc<dyn PreferenceStore>,
    repository: Arc<dyn NotificationRepository>,
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    events: Arc<dyn EventSink>,
    filter: DeliveryFilter,
    queue: RetryQueue,
    processing: AtomicBool,
    counters: EngineCounters,
    cancellation_token: CancellationToken,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationEngine {
    pub fn builder(
        preferences: Arc<dyn PreferenceStore>,
        repository: Arc<dyn NotificationRepository>,
    ) -> NotificationEngineBuilder {
        NotificationEngineBuilder {
            config: EngineConfig::default(),
            preferences,
            repository,
            senders: HashMap::new(),
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Deliver `notification` now, or defer it.
    ///
    /// Returns one result per attempted channel, or a single synthetic
    /// result when the notification was deferred or had no eligible channel.
    /// Fails only when the notification is invalid or the preference store
    /// or repository cannot be reached; the notification then stays pending.
    pub async fn send(&self, notification: Notification) -> Result<Vec<DeliveryResult>> {
        notification.validate()?;
        self.repository.record_notification(&notification).await?;

        let now = Utc::now();
        if let Some(at) = notification.scheduled_for.filter(|at| *at > now) {
            let id = notification.id.clone();
            self.enqueue_scheduled(notification, at).await?;
            return Ok(vec![DeliveryResult::scheduled(id, at)]);
        }

        let preferences = self
            .preferences
            .get(&notification.recipient_id)
            .await
            .inspect_err(|e| {
                error!(
                    notification_id = %notification.id,
                    recipient_id = %notification.recipient_id,
                    error = %e,
                    "Failed to resolve notification preferences"
                );
            })?;

        let decision = self.filter.filter(&notification, &preferences, now);

        if let Some(until) = decision.defer_until {
            debug!(notification_id = %notification.id, %until, "Deferred by quiet hours");
            let id = notification.id.clone();
            self.enqueue_scheduled(notification, until).await?;
            return Ok(vec![DeliveryResult::scheduled(id, until)]);
        }

        if decision.channels.is_empty() {
            self.finalize_failed(&notification, NO_ELIGIBLE_CHANNEL).await;
            return Ok(vec![DeliveryResult::no_eligible_channel(&notification.id)]);
        }

        let results = self.fan_out(&notification, &decision.channels).await;

        match settle(&results) {
            Settlement::Sent => self.finalize_sent(&notification, &results).await,
            Settlement::Retry { permanent, error } => {
                let mut item = RetryQueueItem::new(
                    notification.clone(),
                    now,
                    self.retry_policy.max_attempts,
                );
                item.excluded_channels = permanent;
                item.record_failure(&self.retry_policy, now, &error);
                self.retry_or_fail(item, &results).await;
            }
            Settlement::Failed(reason) => {
                self.emit_delivery(&notification, NotificationStatus::Failed, &results);
                self.finalize_failed(&notification, &reason).await;
            }
        }

        Ok(results)
    }

    /// Send a templated notification to every recipient of `batch`.
    ///
    /// Recipients are processed in chunks of `batch_size`, concurrently
    /// within a chunk, with `batch_delay` between chunks. A recipient whose
    /// send errors gets a single failed result; later chunks still run.
    pub async fn send_batch(&self, batch: BatchRequest) -> Vec<DeliveryResult> {
        let batch_size = self.config.batch_size.max(1);
        let chunk_count = batch.recipient_ids.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(batch.recipient_ids.len());

        info!(
            recipients = batch.recipient_ids.len(),
            chunks = chunk_count,
            notification_type = %batch.notification_type,
            "Sending notification batch"
        );

        for (index, chunk) in batch.recipient_ids.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay()).await;
            }

            let sends = chunk.iter().map(|recipient_id| {
                let notification = batch.notification_for(recipient_id);
                async move {
                    let id = notification.id.clone();
                    match self.send(notification).await {
                        Ok(results) => results,
                        Err(e) => {
                            warn!(notification_id = %id, error = %e, "Batch send failed for recipient");
                            vec![DeliveryResult::engine_error(id, e.to_string())]
                        }
                    }
                }
            });

            for recipient_results in join_all(sends).await {
                results.extend(recipient_results);
            }
            debug!(chunk = index + 1, of = chunk_count, "Batch chunk done");
        }

        results
    }

    /// Queue `notification` for a delivery attempt at `at`.
    ///
    /// Scheduling the same id twice produces two queue entries.
    pub async fn schedule(&self, notification: Notification, at: DateTime<Utc>) -> Result<()> {
        notification.validate()?;
        if self.repository.get(&notification.id).await?.is_none() {
            self.repository.record_notification(&notification).await?;
        }
        self.enqueue_scheduled(notification, at).await
    }

    async fn enqueue_scheduled(&self, mut notification: Notification, at: DateTime<Utc>) -> Result<()> {
        self.repository
            .update_status(&notification.id, NotificationStatus::Scheduled, None)
            .await?;
        notification.set_status(NotificationStatus::Scheduled, Utc::now());

        let payload = json!({
            "id": notification.id,
            "type": notification.notification_type,
            "scheduled_for": at,
        });
        self.queue.insert(RetryQueueItem::new(
            notification,
            at,
            self.retry_policy.max_attempts,
        ));
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        self.events
            .emit(EngineEvent::new(NOTIFICATION_SCHEDULED).with_payload(payload));
        Ok(())
    }

    /// Remove a queued notification and mark it cancelled.
    ///
    /// Returns `false` when nothing was queued under `notification_id`.
    pub async fn cancel(&self, notification_id: &str) -> Result<bool> {
        if !self.queue.remove(notification_id) {
            return Ok(false);
        }

        self.repository
            .update_status(notification_id, NotificationStatus::Cancelled, None)
            .await?;
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.events.emit(
            EngineEvent::new(NOTIFICATION_CANCELLED).with_payload(json!({ "id": notification_id })),
        );
        info!(notification_id, "Notification cancelled");
        Ok(true)
    }

    /// Mark a notification as read by its recipient.
    ///
    /// Reading an already-read notification is a no-op.
    pub async fn mark_as_read(&self, notification_id: &str, user_id: &str) -> Result<()> {
        let notification = self
            .repository
            .get(notification_id)
            .await?
            .filter(|n| n.recipient_id == user_id)
            .ok_or_else(|| Error::not_found("Notification", notification_id))?;

        match notification.status {
            NotificationStatus::Read => return Ok(()),
            NotificationStatus::Sent => {}
            NotificationStatus::Failed if notification.requested(Channel::InApp) => {}
            other => return Err(Error::invalid_transition(other, NotificationStatus::Read)),
        }

        self.repository
            .update_status(notification_id, NotificationStatus::Read, None)
            .await?;
        self.events.emit(
            EngineEvent::new(NOTIFICATION_READ)
                .with_payload(json!({ "id": notification_id, "user_id": user_id })),
        );
        Ok(())
    }

    pub async fn mark_all_as_read(&self, user_id: &str) -> Result<u64> {
        let count = self.repository.mark_all_read(user_id).await?;
        if count > 0 {
            self.events.emit(
                EngineEvent::new(NOTIFICATION_READ)
                    .with_payload(json!({ "user_id": user_id, "count": count })),
            );
        }
        Ok(count)
    }

    pub async fn notifications_for_user(
        &self,
        user_id: &str,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>> {
        self.repository.list_for_user(user_id, query).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.repository.unread_count(user_id).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queue_size: self.queue.size(),
            next_due: self.queue.next_due(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Spawn the queue processor.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Notification engine disabled; queue processor not started");
            return;
        }

        let mut processor = self.processor.lock();
        if processor.is_some() {
            warn!("Queue processor already running");
            return;
        }

        let engine = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();
        let tick = self.config.tick_interval();

        *processor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Queue processor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        engine.process_ready(Utc::now()).await;
                    }
                }
            }
        }));

        info!(tick_ms = self.config.tick_interval_ms, "Notification queue processor started");
    }

    /// Stop the queue processor and wait for the current pass to finish.
    ///
    /// Queued items stay in the queue. A stopped engine cannot be restarted.
    pub async fn stop(&self) {
        info!("Stopping notification engine");
        self.cancellation_token.cancel();

        let handle = self.processor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue processor task failed");
            }
        }

        info!(queued = self.queue.size(), "Notification engine stopped");
    }

    /// Run one processing pass over items ready at `now`.
    ///
    /// Returns the number of items handled, or `None` when another pass is
    /// still running and this one was skipped.
    pub async fn process_ready(&self, now: DateTime<Utc>) -> Option<usize> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Queue pass already running, skipping tick");
            return None;
        }
        let _guard = PassGuard(&self.processing);

        let ready = self.queue.pop_ready(now);
        let count = ready.len();
        if count == 0 {
            return Some(0);
        }

        debug!(count, "Processing ready queue items");
        futures::stream::iter(ready)
            .for_each_concurrent(self.config.queue_concurrency.max(1), |item| {
                self.process_item(item, now)
            })
            .await;

        Some(count)
    }

    async fn process_item(&self, mut item: RetryQueueItem, now: DateTime<Utc>) {
        let preferences = match self.preferences.get(&item.notification.recipient_id).await {
            Ok(preferences) => preferences,
            Err(e) => {
                error!(
                    notification_id = %item.notification_id(),
                    error = %e,
                    "Failed to resolve preferences for queued notification"
                );
                item.record_failure(&self.retry_policy, now, e.to_string());
                self.retry_or_fail(item, &[]).await;
                return;
            }
        };

        let mut channels = self.filter.eligible_channels(&item.notification, &preferences);
        channels.retain(|c| !item.excluded_channels.contains(c));
        if channels.is_empty() {
            self.finalize_failed(&item.notification, NO_ELIGIBLE_CHANNEL).await;
            return;
        }

        let results = self.fan_out(&item.notification, &channels).await;

        match settle(&results) {
            Settlement::Sent => self.finalize_sent(&item.notification, &results).await,
            Settlement::Retry { permanent, error } => {
                item.excluded_channels.extend(permanent);
                item.record_failure(&self.retry_policy, now, error);
                self.retry_or_fail(item, &results).await;
            }
            Settlement::Failed(reason) => {
                self.emit_delivery(&item.notification, NotificationStatus::Failed, &results);
                self.finalize_failed(&item.notification, &reason).await;
            }
        }
    }

    /// Send to every channel concurrently and collect all results.
    ///
    /// Each sender runs in its own task, so a panicking sender yields a
    /// failed result for its channel only.
    async fn fan_out(&self, notification: &Notification, channels: &BTreeSet<Channel>) -> Vec<DeliveryResult> {
        let message = Arc::new(RenderedMessage::from(notification));

        let sends = channels.iter().map(|&channel| {
            let sender = self.senders.get(&channel).cloned();
            let message = Arc::clone(&message);
            let recipient_id = notification.recipient_id.clone();
            let notification_id = notification.id.clone();

            async move {
                let Some(sender) = sender else {
                    debug!(%channel, %notification_id, "No sender registered");
                    return DeliveryResult::not_configured(notification_id, channel);
                };

                let task = tokio::spawn(async move { sender.send(&recipient_id, &message).await });
                match task.await {
                    Ok(result) => {
                        if !result.success {
                            debug!(
                                %channel,
                                %notification_id,
                                error = ?result.error,
                                permanent = result.permanent,
                                "Channel delivery failed"
                            );
                        }
                        result
                    }
                    Err(e) => {
                        error!(%channel, %notification_id, error = %e, "Channel sender crashed");
                        DeliveryResult::failed(notification_id, channel, format!("channel sender crashed: {}", e))
                    }
                }
            }
        });

        join_all(sends).await
    }

    /// Requeue a failed attempt, or finalize it once no attempt is left.
    async fn retry_or_fail(&self, mut item: RetryQueueItem, results: &[DeliveryResult]) {
        if item.is_exhausted() {
            let reason = item
                .last_error
                .clone()
                .unwrap_or_else(|| "retry attempts exhausted".to_string());
            warn!(
                notification_id = %item.notification_id(),
                attempts = item.attempts,
                "Giving up on notification"
            );
            if !results.is_empty() {
                self.emit_delivery(&item.notification, NotificationStatus::Failed, results);
            }
            self.finalize_failed(&item.notification, &reason).await;
            return;
        }

        // Scheduled and deferred items fall back to pending once they have failed.
        if item.notification.status != NotificationStatus::Pending {
            let now = Utc::now();
            if let Err(e) = self
                .repository
                .update_status(&item.notification.id, NotificationStatus::Pending, None)
                .await
            {
                error!(notification_id = %item.notification.id, error = %e, "Failed to record pending status");
            }
            item.notification.set_status(NotificationStatus::Pending, now);
        }

        self.requeue(item, results);
    }

    fn requeue(&self, item: RetryQueueItem, results: &[DeliveryResult]) {
        warn!(
            notification_id = %item.notification_id(),
            attempts = item.attempts,
            next_attempt = %item.next_attempt,
            error = ?item.last_error,
            "Delivery failed, queued for retry"
        );
        if !results.is_empty() {
            self.emit_delivery(&item.notification, NotificationStatus::Pending, results);
        }
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        self.queue.insert(item);
    }

    async fn finalize_sent(&self, notification: &Notification, results: &[DeliveryResult]) {
        if let Err(e) = self
            .repository
            .update_status(&notification.id, NotificationStatus::Sent, None)
            .await
        {
            error!(notification_id = %notification.id, error = %e, "Failed to record sent status");
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.emit_delivery(notification, NotificationStatus::Sent, results);
    }

    async fn finalize_failed(&self, notification: &Notification, reason: &str) {
        warn!(notification_id = %notification.id, reason, "Notification failed");
        if let Err(e) = self
            .repository
            .update_status(&notification.id, NotificationStatus::Failed, Some(reason))
            .await
        {
            error!(notification_id = %notification.id, error = %e, "Failed to record failed status");
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(EngineEvent::new(NOTIFICATION_FAILED).with_payload(json!({
            "id": notification.id,
            "type": notification.notification_type,
            "reason": reason,
        })));
    }

    /// Emit `notification_sent` with the per-channel results of an attempt.
    fn emit_delivery(&self, notification: &Notification, status: NotificationStatus, results: &[DeliveryResult]) {
        self.events.emit(EngineEvent::new(NOTIFICATION_SENT).with_payload(json!({
            "id": notification.id,
            "type": notification.notification_type,
            "status": status,
            "results": results,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{InMemoryNotificationRepository, InMemoryPreferenceStore};
    use crate::notification::events::BroadcastEventSink;
    use crate::notification::preferences::{NotificationPreferences, TypePreference};
    use crate::notification::types::CHANNEL_NOT_CONFIGURED;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Test channel that succeeds or fails on demand.
    struct TestChannel {
        channel: Channel,
        fail: Option<bool>,
        calls: AtomicUsize,
    }

    impl TestChannel {
        fn ok(channel: Channel) -> Arc<Self> {
            Arc::new(Self {
                channel,
                fail: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(channel: Channel, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                channel,
                fail: Some(permanent),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelSender for TestChannel {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn send(&self, _recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                None => DeliveryResult::delivered(&message.notification_id, self.channel, None),
                Some(true) => DeliveryResult::permanent_failure(&message.notification_id, self.channel, "gone"),
                Some(false) => DeliveryResult::failed(&message.notification_id, self.channel, "timeout"),
            }
        }
    }

    /// Sender that blocks until released.
    struct BlockingChannel {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ChannelSender for BlockingChannel {
        fn channel(&self) -> Channel {
            Channel::InApp
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn send(&self, _recipient_id: &str, message: &RenderedMessage) -> DeliveryResult {
            self.entered.notify_one();
            self.release.notified().await;
            DeliveryResult::delivered(&message.notification_id, Channel::InApp, None)
        }
    }

    struct PanickingChannel;

    #[async_trait]
    impl ChannelSender for PanickingChannel {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn send(&self, _recipient_id: &str, _message: &RenderedMessage) -> DeliveryResult {
            panic!("smtp exploded");
        }
    }

    fn engine_with(
        store: InMemoryPreferenceStore,
        config: EngineConfig,
        senders: Vec<Arc<dyn ChannelSender>>,
    ) -> (NotificationEngine, Arc<InMemoryNotificationRepository>) {
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let engine = NotificationEngine::builder(Arc::new(store), repo.clone())
            .config(config)
            .channels(senders)
            .build()
            .unwrap();
        (engine, repo)
    }

    fn prefs_allowing(channel: Channel) -> InMemoryPreferenceStore {
        let store = InMemoryPreferenceStore::new();
        store.insert(
            NotificationPreferences::default_for_user("u1")
                .with_type(NotificationType::LevelUp, TypePreference::enabled([channel])),
        );
        store
    }

    fn in_app(id: &str) -> Notification {
        Notification::new(NotificationType::LevelUp, "u1", "Level 2", "Nice").with_id(id)
    }

    #[test]
    fn settle_classifies_results() {
        let ok = DeliveryResult::delivered("n", Channel::InApp, None);
        let transient = DeliveryResult::failed("n", Channel::Push, "timeout");
        let permanent = DeliveryResult::permanent_failure("n", Channel::Email, "bounced");

        assert!(matches!(settle(&[ok, transient.clone()]), Settlement::Sent));
        match settle(&[transient, permanent.clone()]) {
            Settlement::Retry { permanent, error } => {
                assert_eq!(permanent, BTreeSet::from([Channel::Email]));
                assert!(error.contains("push: timeout"));
                assert!(error.contains("email: bounced"));
            }
            _ => panic!("expected retry"),
        }
        assert!(matches!(settle(&[permanent]), Settlement::Failed(_)));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let result = NotificationEngine::builder(
            Arc::new(InMemoryPreferenceStore::new()),
            Arc::new(InMemoryNotificationRepository::new()),
        )
        .config(EngineConfig {
            batch_size: 0,
            ..Default::default()
        })
        .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn unregistered_channel_reports_not_configured() {
        let (engine, repo) = engine_with(
            prefs_allowing(Channel::Sms),
            EngineConfig::default(),
            vec![TestChannel::ok(Channel::InApp)],
        );

        let n = in_app("n1").with_channels([Channel::InApp, Channel::Sms]);
        let results = engine.send(n).await.unwrap();

        assert_eq!(results.len(), 2);
        let sms = results.iter().find(|r| r.channel == Some(Channel::Sms)).unwrap();
        assert_eq!(sms.error.as_deref(), Some(CHANNEL_NOT_CONFIGURED));
        assert_eq!(
            repo.get("n1").await.unwrap().unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn panicking_sender_becomes_failed_result() {
        let (engine, _repo) = engine_with(
            prefs_allowing(Channel::Email),
            EngineConfig::default(),
            vec![TestChannel::ok(Channel::InApp), Arc::new(PanickingChannel)],
        );

        let results = engine
            .send(in_app("n1").with_channels([Channel::InApp, Channel::Email]))
            .await
            .unwrap();

        let email = results.iter().find(|r| r.channel == Some(Channel::Email)).unwrap();
        assert!(!email.success);
        assert!(email.error.as_deref().unwrap().contains("crashed"));
        assert!(results.iter().any(|r| r.success));
    }

    #[tokio::test]
    async fn transient_failure_is_queued_as_first_attempt() {
        let sender = TestChannel::failing(Channel::InApp, false);
        let (engine, repo) = engine_with(InMemoryPreferenceStore::new(), EngineConfig::default(), vec![sender.clone()]);

        let results = engine.send(in_app("n1")).await.unwrap();

        assert!(!results[0].success);
        let queued = engine.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(
            repo.get("n1").await.unwrap().unwrap().status,
            NotificationStatus::Pending
        );
        assert_eq!(engine.stats().retried, 1);
    }

    #[tokio::test]
    async fn single_attempt_budget_fails_without_queueing() {
        let sender = TestChannel::failing(Channel::InApp, false);
        let config = EngineConfig {
            max_attempts: 1,
            ..Default::default()
        };
        let (engine, repo) = engine_with(InMemoryPreferenceStore::new(), config, vec![sender.clone()]);

        engine.send(in_app("n1")).await.unwrap();

        assert!(engine.queue().is_empty());
        assert_eq!(
            repo.get("n1").await.unwrap().unwrap().status,
            NotificationStatus::Failed
        );
        assert!(!engine.cancel("n1").await.unwrap());
        assert_eq!(engine.stats().retried, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_final() {
        let sender = TestChannel::failing(Channel::InApp, true);
        let (engine, repo) = engine_with(InMemoryPreferenceStore::new(), EngineConfig::default(), vec![sender.clone()]);

        engine.send(in_app("n1")).await.unwrap();

        assert!(engine.queue().is_empty());
        let stored = repo.get("n1").await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("gone"));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_removes_queued_item() {
        let events = Arc::new(BroadcastEventSink::default());
        let mut rx = events.subscribe();
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let engine = NotificationEngine::builder(Arc::new(InMemoryPreferenceStore::new()), repo.clone())
            .channel(TestChannel::ok(Channel::InApp))
            .event_sink(events)
            .build()
            .unwrap();

        engine
            .schedule(in_app("n1"), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, NOTIFICATION_SCHEDULED);

        assert!(engine.cancel("n1").await.unwrap());
        assert!(!engine.cancel("n1").await.unwrap());
        assert!(!engine.cancel("unknown").await.unwrap());

        assert_eq!(rx.recv().await.unwrap().name, NOTIFICATION_CANCELLED);
        assert_eq!(
            repo.get("n1").await.unwrap().unwrap().status,
            NotificationStatus::Cancelled
        );
        assert_eq!(engine.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let blocking = Arc::new(BlockingChannel {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (engine, _repo) =
            engine_with(InMemoryPreferenceStore::new(), EngineConfig::default(), vec![blocking.clone()]);
        let engine = Arc::new(engine);
        let now = Utc::now();
        engine.schedule(in_app("n1"), now).await.unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.process_ready(now).await }
        });
        blocking.entered.notified().await;

        assert_eq!(engine.process_ready(now).await, None);

        blocking.release.notify_one();
        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(engine.process_ready(now).await, Some(0));
    }

    #[tokio::test]
    async fn start_and_stop_processor() {
        let config = EngineConfig {
            tick_interval_ms: 10,
            ..Default::default()
        };
        let (engine, repo) = engine_with(InMemoryPreferenceStore::new(), config, vec![TestChannel::ok(Channel::InApp)]);
        let engine = Arc::new(engine);
        engine.schedule(in_app("n1"), Utc::now()).await.unwrap();

        engine.start();
        for _ in 0..100 {
            if engine.queue().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        engine.stop().await;

        assert!(engine.queue().is_empty());
        assert_eq!(
            repo.get("n1").await.unwrap().unwrap().status,
            NotificationStatus::Sent
        );
    }
}
