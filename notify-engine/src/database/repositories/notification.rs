//! Notification repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::database::models::NotificationDbModel;
use crate::database::time::now_ms;
use crate::notification::events::NotificationType;
use crate::notification::types::{Notification, NotificationStatus};
use crate::{Error, Result};

/// Default page size for [`NotificationQuery`].
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Filters for listing a user's notifications. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub status: Option<NotificationStatus>,
    #[serde(default, rename = "type")]
    pub notification_type: Option<NotificationType>,
    /// Only `sent` notifications (delivered, not yet read).
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    DEFAULT_LIST_LIMIT
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            status: None,
            notification_type: None,
            unread_only: false,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl NotificationQuery {
    pub fn unread() -> Self {
        Self {
            unread_only: true,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: NotificationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Whether `notification` passes the status, type and unread filters.
    pub fn matches(&self, notification: &Notification) -> bool {
        self.status.is_none_or(|s| notification.status == s)
            && self
                .notification_type
                .is_none_or(|t| notification.notification_type == t)
            && (!self.unread_only || notification.status == NotificationStatus::Sent)
    }
}

/// Storage for notification records.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn record_notification(&self, notification: &Notification) -> Result<()>;

    /// Set `status`, stamping `updated_at` (and `read_at` on the first read).
    ///
    /// `reason` replaces the stored failure reason.
    async fn update_status(&self, id: &str, status: NotificationStatus, reason: Option<&str>) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Notification>>;

    async fn list_for_user(&self, user_id: &str, query: &NotificationQuery) -> Result<Vec<Notification>>;

    /// Number of delivered, unread notifications.
    async fn unread_count(&self, user_id: &str) -> Result<u64>;

    /// Move every unread notification of `user_id` to `read`; returns how many changed.
    async fn mark_all_read(&self, user_id: &str) -> Result<u64>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn record_notification(&self, notification: &Notification) -> Result<()> {
        let row = NotificationDbModel::from_notification(notification)?;
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, notification_type, recipient_id, title, body, data, channels,
                priority, status, scheduled_for, failure_reason, created_at, updated_at, read_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.notification_type)
        .bind(&row.recipient_id)
        .bind(&row.title)
        .bind(&row.body)
        .bind(&row.data)
        .bind(&row.channels)
        .bind(&row.priority)
        .bind(&row.status)
        .bind(row.scheduled_for)
        .bind(&row.failure_reason)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: NotificationStatus, reason: Option<&str>) -> Result<()> {
        let now = now_ms();
        let read_at = (status == NotificationStatus::Read).then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE notifications SET
                status = ?,
                failure_reason = ?,
                updated_at = ?,
                read_at = COALESCE(read_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(reason)
        .bind(now)
        .bind(read_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Notification", id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(NotificationDbModel::into_notification)
            .transpose()
    }

    async fn list_for_user(&self, user_id: &str, query: &NotificationQuery) -> Result<Vec<Notification>> {
        // Build dynamic WHERE clause
        let mut conditions: Vec<&str> = vec!["recipient_id = ?"];
        if query.status.is_some() {
            conditions.push("status = ?");
        }
        if query.notification_type.is_some() {
            conditions.push("notification_type = ?");
        }
        if query.unread_only {
            conditions.push("status = 'sent'");
        }

        let sql = format!(
            "SELECT * FROM notifications WHERE {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            conditions.join(" AND ")
        );

        let mut q = sqlx::query_as::<_, NotificationDbModel>(&sql).bind(user_id);
        if let Some(status) = query.status {
            q = q.bind(status.to_string());
        }
        if let Some(notification_type) = query.notification_type {
            q = q.bind(notification_type.as_str());
        }
        q = q.bind(query.limit).bind(query.offset);

        q.fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(NotificationDbModel::into_notification)
            .collect()
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ? AND status = 'sent'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notifications SET
                status = 'read',
                updated_at = ?,
                read_at = COALESCE(read_at, ?)
            WHERE recipient_id = ? AND status = 'sent'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
