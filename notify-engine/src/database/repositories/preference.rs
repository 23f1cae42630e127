//! Preference store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;
use crate::database::models::NotificationPreferencesDbModel;
use crate::notification::preferences::{NotificationPreferences, PreferenceUpdate};

/// Resolves and updates per-user notification preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Preferences for `user_id`.
    ///
    /// A user without a record gets [`NotificationPreferences::default_for_user`];
    /// "not found" is never an error. An `Err` means the store itself failed.
    async fn get(&self, user_id: &str) -> Result<NotificationPreferences>;

    /// Merge `update` into the stored (or default) preferences and persist.
    async fn update(&self, user_id: &str, update: PreferenceUpdate) -> Result<NotificationPreferences>;
}

/// SQLx implementation of PreferenceStore.
pub struct SqlxPreferenceStore {
    pool: SqlitePool,
}

impl SqlxPreferenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for SqlxPreferenceStore {
    async fn get(&self, user_id: &str) -> Result<NotificationPreferences> {
        let row = sqlx::query_as::<_, NotificationPreferencesDbModel>(
            "SELECT * FROM notification_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_preferences(),
            None => Ok(NotificationPreferences::default_for_user(user_id)),
        }
    }

    async fn update(&self, user_id: &str, update: PreferenceUpdate) -> Result<NotificationPreferences> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, NotificationPreferencesDbModel>(
            "SELECT * FROM notification_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut preferences = match existing {
            Some(row) => row.into_preferences()?,
            None => NotificationPreferences::default_for_user(user_id),
        };
        preferences.apply(update);

        let row = NotificationPreferencesDbModel::from_preferences(&preferences)?;
        sqlx::query(
            r#"
            INSERT INTO notification_preferences (user_id, settings, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                settings = excluded.settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.settings)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(user_id, "Updated notification preferences");
        Ok(preferences)
    }
}
