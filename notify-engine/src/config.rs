//! Engine and channel configuration.
//!
//! Every field has a default; `from_env` overlays `NOTIFY_*` variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notification::channels::{EmailConfig, PushConfig, RelayConfig, SmsConfig};
use crate::notification::queue::RetryPolicy;
use crate::{Error, Result};

/// Notification engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When false, `start` does not spawn the queue processor.
    pub enabled: bool,
    /// Delivery attempts per queued notification.
    pub max_attempts: u32,
    /// Base retry delay; the n-th retry waits n times this.
    pub retry_delay_ms: u64,
    /// Queue processor tick.
    pub tick_interval_ms: u64,
    /// Recipients per `send_batch` chunk.
    pub batch_size: usize,
    /// Pause between batch chunks.
    pub batch_delay_ms: u64,
    /// Ready queue items processed concurrently per tick.
    pub queue_concurrency: usize,
    /// Capacity of the broadcast event sink.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            retry_delay_ms: 5_000,
            tick_interval_ms: 1_000,
            batch_size: 50,
            batch_delay_ms: 100,
            queue_concurrency: 16,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `NOTIFY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "NOTIFY_ENABLED")? {
            config.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_TICK_INTERVAL_MS")? {
            config.tick_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_BATCH_DELAY_MS")? {
            config.batch_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFY_QUEUE_CONCURRENCY")? {
            config.queue_concurrency = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::config("tick_interval_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_attempts: self.max_attempts,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Channel adapter settings and optional relay endpoints.
///
/// A channel without a relay is built unconfigured and reports
/// "channel not configured" for every send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: EmailConfig,
    pub push: PushConfig,
    pub sms: SmsConfig,
    pub email_relay: Option<RelayConfig>,
    pub push_relay: Option<RelayConfig>,
    pub sms_relay: Option<RelayConfig>,
}

impl ChannelsConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeout_secs: Option<u64> = parse_var(&lookup, "NOTIFY_RELAY_TIMEOUT_SECS")?;
        let relay = |prefix: &str| -> Option<RelayConfig> {
            let url = lookup(&format!("NOTIFY_{}_RELAY_URL", prefix)).filter(|u| !u.trim().is_empty())?;
            let mut config = RelayConfig::new(url);
            config.token = lookup(&format!("NOTIFY_{}_RELAY_TOKEN", prefix)).filter(|t| !t.is_empty());
            if let Some(secs) = timeout_secs {
                config.timeout_secs = secs;
            }
            Some(config)
        };

        Ok(Self {
            email_relay: relay("EMAIL"),
            push_relay: relay("PUSH"),
            sms_relay: relay("SMS"),
            ..Default::default()
        })
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("invalid value for {}: {:?}", key, raw))),
    }
}
