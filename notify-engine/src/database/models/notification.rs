//! Notification row model.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_ms_to_datetime};
use crate::notification::events::NotificationType;
use crate::notification::types::{Channel, Notification, NotificationPriority, NotificationStatus};
use crate::{Error, Result};

/// Row of the `notifications` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub notification_type: String,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    /// JSON object
    pub data: String,
    /// JSON array of channel names
    pub channels: String,
    pub priority: String,
    pub status: String,
    pub scheduled_for: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub read_at: Option<i64>,
}

impl NotificationDbModel {
    pub fn from_notification(notification: &Notification) -> Result<Self> {
        Ok(Self {
            id: notification.id.clone(),
            notification_type: notification.notification_type.as_str().to_string(),
            recipient_id: notification.recipient_id.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: serde_json::to_string(&notification.data)?,
            channels: serde_json::to_string(&notification.channels)?,
            priority: notification.priority.to_string(),
            status: notification.status.to_string(),
            scheduled_for: notification.scheduled_for.map(datetime_to_ms),
            failure_reason: notification.failure_reason.clone(),
            created_at: datetime_to_ms(notification.created_at),
            updated_at: datetime_to_ms(notification.updated_at),
            read_at: notification.read_at.map(datetime_to_ms),
        })
    }

    pub fn into_notification(self) -> Result<Notification> {
        let notification_type = NotificationType::from_str(&self.notification_type)?;
        let priority = NotificationPriority::from_str(&self.priority)
            .map_err(|_| Error::Database(format!("invalid priority '{}' on {}", self.priority, self.id)))?;
        let status = NotificationStatus::from_str(&self.status)
            .map_err(|_| Error::Database(format!("invalid status '{}' on {}", self.status, self.id)))?;
        let channels: BTreeSet<Channel> = serde_json::from_str(&self.channels)?;

        Ok(Notification {
            id: self.id,
            notification_type,
            recipient_id: self.recipient_id,
            title: self.title,
            body: self.body,
            data: serde_json::from_str(&self.data)?,
            channels,
            priority,
            status,
            scheduled_for: opt_ms_to_datetime(self.scheduled_for),
            failure_reason: self.failure_reason,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            read_at: opt_ms_to_datetime(self.read_at),
        })
    }
}
