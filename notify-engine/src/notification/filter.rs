//! Preference and quiet-hours filtering.
//!
//! [`DeliveryFilter`] narrows a notification's requested channels against
//! the recipient's preferences and decides whether delivery must wait for
//! the end of the recipient's quiet hours.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::warn;

use super::preferences::{NotificationPreferences, QuietHours};
use super::types::{Channel, Notification, NotificationPriority};

/// Result of filtering one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterDecision {
    /// Channels the notification may be delivered on.
    pub channels: BTreeSet<Channel>,
    /// When set, nothing is sent now; delivery waits until this instant.
    pub defer_until: Option<DateTime<Utc>>,
}

impl FilterDecision {
    /// Nothing to deliver and nothing to wait for.
    pub fn is_dead_end(&self) -> bool {
        self.channels.is_empty() && self.defer_until.is_none()
    }
}

/// Stateless preference filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliveryFilter;

impl DeliveryFilter {
    pub fn new() -> Self {
        Self
    }

    /// Compute the allowed channels and an optional deferral for `notification`.
    pub fn filter(
        &self,
        notification: &Notification,
        preferences: &NotificationPreferences,
        now: DateTime<Utc>,
    ) -> FilterDecision {
        let channels = self.eligible_channels(notification, preferences);

        // A preference mismatch is final; deferring it would change nothing.
        if channels.is_empty() || !preferences.global.enabled {
            return FilterDecision {
                channels,
                defer_until: None,
            };
        }

        let defer_until = preferences.global.quiet_hours.as_ref().and_then(|qh| {
            let must_wait = preferences.global.do_not_disturb
                || notification.priority != NotificationPriority::Urgent;
            if must_wait && quiet_hours_active(qh, now) {
                Some(quiet_hours_end(qh, now))
            } else {
                None
            }
        });

        FilterDecision {
            channels,
            defer_until,
        }
    }

    /// Narrow the requested channels by preferences, ignoring quiet hours.
    ///
    /// In-app is kept whenever it was requested: it holds the unread state
    /// and is exempt from suppression.
    pub fn eligible_channels(
        &self,
        notification: &Notification,
        preferences: &NotificationPreferences,
    ) -> BTreeSet<Channel> {
        let in_app_requested = notification.requested(Channel::InApp);

        if !preferences.global.enabled {
            return if in_app_requested {
                BTreeSet::from([Channel::InApp])
            } else {
                BTreeSet::new()
            };
        }

        let mut channels: BTreeSet<Channel> =
            match preferences.type_preference(notification.notification_type) {
                Some(pref) if pref.enabled => notification
                    .channels
                    .intersection(&pref.channels)
                    .copied()
                    .collect(),
                _ => BTreeSet::new(),
            };

        if in_app_requested {
            channels.insert(Channel::InApp);
        }
        channels
    }
}

/// Resolve the quiet-hours timezone, falling back to UTC for unknown names.
fn resolve_timezone(quiet_hours: &QuietHours) -> Tz {
    quiet_hours.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!(
            timezone = %quiet_hours.timezone,
            "Unknown quiet-hours timezone, using UTC"
        );
        Tz::UTC
    })
}

/// Whether `now` falls inside the quiet-hours window (bounds inclusive).
pub fn quiet_hours_active(quiet_hours: &QuietHours, now: DateTime<Utc>) -> bool {
    let tz = resolve_timezone(quiet_hours);
    let local = now.with_timezone(&tz).time();

    if quiet_hours.wraps_midnight() {
        local >= quiet_hours.start || local <= quiet_hours.end
    } else {
        quiet_hours.start <= local && local <= quiet_hours.end
    }
}

/// The next end of the quiet-hours window as seen from `now`.
///
/// For a window that wraps midnight and has already started today, the end
/// falls on the next local day.
pub fn quiet_hours_end(quiet_hours: &QuietHours, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = resolve_timezone(quiet_hours);
    let local = now.with_timezone(&tz);
    let today = local.date_naive();

    let end_date = if quiet_hours.wraps_midnight() && local.time() >= quiet_hours.start {
        today.succ_opt().unwrap_or(today)
    } else {
        today
    };

    local_instant(tz, end_date, quiet_hours.end).unwrap_or(now)
}

/// Map a local wall-clock time to UTC, stepping over DST gaps.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}
