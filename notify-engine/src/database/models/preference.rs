//! Preference row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::database::time::now_ms;
use crate::notification::preferences::NotificationPreferences;

/// Row of the `notification_preferences` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationPreferencesDbModel {
    pub user_id: String,
    /// JSON-encoded [`NotificationPreferences`].
    pub settings: String,
    pub updated_at: i64,
}

impl NotificationPreferencesDbModel {
    pub fn from_preferences(preferences: &NotificationPreferences) -> Result<Self> {
        Ok(Self {
            user_id: preferences.user_id.clone(),
            settings: serde_json::to_string(preferences)?,
            updated_at: now_ms(),
        })
    }

    pub fn into_preferences(self) -> Result<NotificationPreferences> {
        let mut preferences: NotificationPreferences = serde_json::from_str(&self.settings)?;
        preferences.user_id = self.user_id;
        Ok(preferences)
    }
}
