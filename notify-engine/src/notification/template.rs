//! Placeholder substitution for batch notifications.
//!
//! Templates use `{{key}}` placeholders filled from a string-keyed map.
//! Placeholders without a value are left verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::NotificationData;

/// Title and body templates shared by every recipient of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTemplate {
    pub title: String,
    pub body: String,
}

impl BatchTemplate {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }

    /// Render title and body for one recipient.
    ///
    /// `recipient_id` is available as `{{recipient_id}}` unless `data`
    /// already defines that key.
    pub fn render(&self, recipient_id: &str, data: &NotificationData) -> (String, String) {
        let lookup = |key: &str| -> Option<String> {
            match data.get(key) {
                Some(value) => Some(value_to_text(value)),
                None if key == "recipient_id" => Some(recipient_id.to_string()),
                None => None,
            }
        };
        (render(&self.title, &lookup), render(&self.body, &lookup))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{key}}` in `template` for which `lookup` yields a value.
pub fn render(template: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = after_open[..close].trim();
        match lookup(key) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }

    out.push_str(rest);
    out
}
