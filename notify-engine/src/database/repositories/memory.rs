//! In-memory repositories.
//!
//! Same contracts as the SQLx repositories, backed by `parking_lot` locks.
//! Records live for the lifetime of the value.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::notification::{NotificationQuery, NotificationRepository};
use super::preference::PreferenceStore;
use crate::notification::preferences::{NotificationPreferences, PreferenceUpdate};
use crate::notification::types::{Notification, NotificationStatus};
use crate::{Error, Result};

/// Notification repository kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryNotificationRepository {
    // Insertion order breaks created_at ties when listing.
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notifications.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.read().is_empty()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn record_notification(&self, notification: &Notification) -> Result<()> {
        let mut notifications = self.notifications.write();
        if notifications.iter().any(|n| n.id == notification.id) {
            return Err(Error::Database(format!(
                "notification {} already recorded",
                notification.id
            )));
        }
        notifications.push(notification.clone());
        Ok(())
    }

    async fn update_status(&self, id: &str, status: NotificationStatus, reason: Option<&str>) -> Result<()> {
        let mut notifications = self.notifications.write();
        let notification = notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::not_found("Notification", id))?;
        notification.set_status(status, Utc::now());
        notification.failure_reason = reason.map(str::to_string);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        Ok(self.notifications.read().iter().find(|n| n.id == id).cloned())
    }

    async fn list_for_user(&self, user_id: &str, query: &NotificationQuery) -> Result<Vec<Notification>> {
        let notifications = self.notifications.read();
        let mut matching: Vec<&Notification> = notifications
            .iter()
            .rev()
            .filter(|n| n.recipient_id == user_id && query.matches(n))
            .collect();
        // Stable sort keeps newer insertions first among equal timestamps.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .notifications
            .read()
            .iter()
            .filter(|n| n.recipient_id == user_id && n.status == NotificationStatus::Sent)
            .count() as u64)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut changed = 0;
        for n in self
            .notifications
            .write()
            .iter_mut()
            .filter(|n| n.recipient_id == user_id && n.status == NotificationStatus::Sent)
        {
            n.set_status(NotificationStatus::Read, now);
            changed += 1;
        }
        Ok(changed)
    }
}

/// Preference store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    preferences: RwLock<HashMap<String, NotificationPreferences>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored preferences for `preferences.user_id`.
    pub fn insert(&self, preferences: NotificationPreferences) {
        self.preferences
            .write()
            .insert(preferences.user_id.clone(), preferences);
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, user_id: &str) -> Result<NotificationPreferences> {
        Ok(self
            .preferences
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| NotificationPreferences::default_for_user(user_id)))
    }

    async fn update(&self, user_id: &str, update: PreferenceUpdate) -> Result<NotificationPreferences> {
        let mut preferences = self.preferences.write();
        let entry = preferences
            .entry(user_id.to_string())
            .or_insert_with(|| NotificationPreferences::default_for_user(user_id));
        entry.apply(update);
        Ok(entry.clone())
    }
}
