//! Priority-ordered retry queue.
//!
//! [`RetryQueue`] exclusively owns every queued [`RetryQueueItem`]. All
//! mutation goes through its own methods, which serialize on a single
//! mutex; callers never hold a reference into the queue.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::types::{Channel, Notification};

/// Default maximum delivery attempts per item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base retry delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Linear backoff: the n-th retry waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base_delay.saturating_mul(attempts)
    }

    /// `now + delay_for(attempts)`.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        now + delay
    }
}

/// A notification waiting for a delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueItem {
    pub notification: Notification,
    /// Score derived from the notification priority (urgent=4 ... low=1).
    pub priority: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Eligible for processing once `now >= next_attempt`.
    pub next_attempt: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Channels that failed permanently and must not be tried again.
    pub excluded_channels: BTreeSet<Channel>,
    pub last_error: Option<String>,
}

impl RetryQueueItem {
    pub fn new(notification: Notification, next_attempt: DateTime<Utc>, max_attempts: u32) -> Self {
        Self {
            priority: notification.priority.score(),
            notification,
            attempts: 0,
            max_attempts,
            next_attempt,
            created_at: Utc::now(),
            excluded_channels: BTreeSet::new(),
            last_error: None,
        }
    }

    pub fn notification_id(&self) -> &str {
        &self.notification.id
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt <= now
    }

    /// No attempt is left under `max_attempts`.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Count a failed attempt and push `next_attempt` out by the backoff.
    pub fn record_failure(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        error: impl Into<String>,
    ) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt = policy.next_attempt_at(now, self.attempts);
        self.last_error = Some(error.into());
    }

    /// Queue order: priority desc, then `next_attempt` asc, then `created_at` asc.
    fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.next_attempt.cmp(&other.next_attempt))
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

/// Mutex-guarded, priority-ordered collection of pending deliveries.
#[derive(Debug, Default)]
pub struct RetryQueue {
    items: Mutex<Vec<RetryQueueItem>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping queue order; equal keys stay FIFO.
    pub fn insert(&self, item: RetryQueueItem) {
        let mut items = self.items.lock();
        let idx = items.partition_point(|existing| existing.queue_order(&item) != Ordering::Greater);
        items.insert(idx, item);
    }

    /// Remove and return every item with `next_attempt <= now`, in queue order.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Vec<RetryQueueItem> {
        let mut items = self.items.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *items).into_iter().partition(|item| item.is_ready(now));
        *items = waiting;
        ready
    }

    /// Remove every entry for `notification_id`.
    ///
    /// Returns `false` when nothing was queued under that id.
    pub fn remove(&self, notification_id: &str) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| item.notification_id() != notification_id);
        items.len() != before
    }

    pub fn contains(&self, notification_id: &str) -> bool {
        self.items
            .lock()
            .iter()
            .any(|item| item.notification_id() == notification_id)
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Earliest `next_attempt` across the queue.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.items.lock().iter().map(|item| item.next_attempt).min()
    }

    /// Copy of the queue contents in queue order.
    pub fn snapshot(&self) -> Vec<RetryQueueItem> {
        self.items.lock().clone()
    }
}
