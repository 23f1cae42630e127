//! Per-user notification preferences.
//!
//! Preferences are resolved through a
//! [`PreferenceStore`](crate::database::repositories::PreferenceStore); when no
//! record exists the store returns [`NotificationPreferences::default_for_user`],
//! under which only the in-app channel survives filtering.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::events::NotificationType;
use super::types::Channel;
use crate::{Error, Result};

/// How often a notification type should reach the user.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFrequency {
    #[default]
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

/// Preference entry for a single notification type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePreference {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channels: BTreeSet<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<DeliveryFrequency>,
}

impl TypePreference {
    pub fn enabled(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            enabled: true,
            channels: channels.into_iter().collect(),
            frequency: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            channels: BTreeSet::new(),
            frequency: None,
        }
    }
}

/// A daily window, in a named IANA timezone, during which non-urgent
/// notifications are deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl QuietHours {
    /// Build from `"HH:MM"` strings and a timezone name such as `"Europe/Berlin"`.
    pub fn new(start: &str, end: &str, timezone: impl Into<String>) -> Result<Self> {
        let timezone = timezone.into();
        timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::validation(format!("unknown timezone: {}", timezone)))?;
        Ok(Self {
            start: hhmm::parse(start)?,
            end: hhmm::parse(end)?,
            timezone,
        })
    }

    /// True when the window crosses midnight (e.g. 22:00 to 08:00).
    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }
}

/// Settings that apply across all notification types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPreferences {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub do_not_disturb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl Default for GlobalPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            do_not_disturb: false,
            quiet_hours: None,
        }
    }
}

/// All notification preferences of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: String,
    #[serde(default)]
    pub per_type: BTreeMap<NotificationType, TypePreference>,
    #[serde(default)]
    pub global: GlobalPreferences,
}

impl NotificationPreferences {
    /// Defaults for a user without a stored record.
    pub fn default_for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            per_type: BTreeMap::new(),
            global: GlobalPreferences::default(),
        }
    }

    pub fn with_type(mut self, notification_type: NotificationType, pref: TypePreference) -> Self {
        self.per_type.insert(notification_type, pref);
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.global.quiet_hours = Some(quiet_hours);
        self
    }

    pub fn type_preference(&self, notification_type: NotificationType) -> Option<&TypePreference> {
        self.per_type.get(&notification_type)
    }

    /// Merge a partial update into these preferences.
    pub fn apply(&mut self, update: PreferenceUpdate) {
        self.per_type.extend(update.per_type);
        if let Some(global) = update.global {
            if let Some(enabled) = global.enabled {
                self.global.enabled = enabled;
            }
            if let Some(dnd) = global.do_not_disturb {
                self.global.do_not_disturb = dnd;
            }
            if global.clear_quiet_hours {
                self.global.quiet_hours = None;
            }
            if let Some(quiet_hours) = global.quiet_hours {
                self.global.quiet_hours = Some(quiet_hours);
            }
        }
    }
}

/// Partial update accepted by `PreferenceStore::update`.
///
/// Per-type entries replace existing entries for the same type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceUpdate {
    #[serde(default)]
    pub per_type: BTreeMap<NotificationType, TypePreference>,
    #[serde(default)]
    pub global: Option<GlobalPreferencesUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPreferencesUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub do_not_disturb: Option<bool>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub clear_quiet_hours: bool,
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// `"HH:MM"` (de)serialization for [`NaiveTime`].
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(value: &str) -> crate::Result<NaiveTime> {
        NaiveTime::parse_from_str(value.trim(), FORMAT)
            .map_err(|e| crate::Error::validation(format!("invalid HH:MM time {:?}: {}", value, e)))
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
