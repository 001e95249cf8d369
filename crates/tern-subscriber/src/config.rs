// Subscriber defaults, boundary constants, and configuration overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Backoff applied before the first stream reopen after an error; doubles on
/// each consecutive failure and resets on any clean close.
pub const INITIAL_CHANNEL_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
/// Largest number of ack ids (and, independently, modify-deadline pairs) a
/// single outbound frame may carry.
pub const MAX_PER_REQUEST_CHANGES: usize = 10_000;
pub const MIN_ACK_DEADLINE_SECONDS: u64 = 10;
pub const MAX_ACK_DEADLINE_SECONDS: u64 = 600;
pub const INITIAL_ACK_DEADLINE_SECONDS: u64 = 10;
/// First lease extension granted by a sweep; doubles per bucket thereafter.
pub const INITIAL_ACK_DEADLINE_EXTENSION_SECONDS: u64 = 2;
pub const ACK_DEADLINE_UPDATE_PERIOD: Duration = Duration::from_secs(60);
pub const PERCENTILE_FOR_ACK_DEADLINE_UPDATES: f64 = 99.9;
/// Debounce window between the first pending ack/nack and the flush it arms.
pub const PENDING_ACKS_SEND_DELAY: Duration = Duration::from_millis(100);

pub(crate) const DEFAULT_ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 10_000;
pub(crate) const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 200 * 1024 * 1024;
pub(crate) const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Subscriber tuning knobs.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Fully qualified subscription name sent in the initialization frame.
    pub subscription: String,
    /// Safety margin subtracted from lease expirations when scheduling the
    /// extension sweep, tolerating clock skew and scheduler jitter.
    pub ack_expiration_padding: Duration,
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    /// Depth of the per-stream outbound request queue.
    pub outbound_queue_depth: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberConfigOverride {
    ack_expiration_padding_ms: Option<u64>,
    max_outstanding_messages: Option<usize>,
    max_outstanding_bytes: Option<usize>,
    outbound_queue_depth: Option<usize>,
}

impl SubscriberConfig {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            ack_expiration_padding: DEFAULT_ACK_EXPIRATION_PADDING,
            max_outstanding_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_outstanding_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }

    /// Defaults, then `TERN_*` environment overrides, then an optional YAML
    /// override file (explicit path or `TERN_SUBSCRIBER_CONFIG`).
    pub fn from_env_or_yaml(
        subscription: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(subscription);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("TERN_SUBSCRIBER_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read subscriber config: {path}"))?;
            let override_cfg: SubscriberConfigOverride =
                serde_yaml::from_str(&contents).context("parse subscriber config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env(subscription: impl Into<String>) -> Self {
        let mut config = Self::new(subscription);
        if let Some(value) = read_u64_env("TERN_ACK_EXPIRATION_PADDING_MS") {
            config.ack_expiration_padding = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("TERN_MAX_OUTSTANDING_MESSAGES") {
            config.max_outstanding_messages = value;
        }
        if let Some(value) = read_usize_env("TERN_MAX_OUTSTANDING_BYTES") {
            config.max_outstanding_bytes = value;
        }
        if let Some(value) = read_usize_env("TERN_OUTBOUND_QUEUE_DEPTH") {
            config.outbound_queue_depth = value;
        }
        config
    }

    /// Stream-wide deadline the first initialization frame carries.
    pub(crate) fn initial_stream_deadline_seconds(&self) -> u64 {
        INITIAL_ACK_DEADLINE_SECONDS
            .max(self.ack_expiration_padding.as_secs())
            .min(MAX_ACK_DEADLINE_SECONDS)
    }
}

impl SubscriberConfigOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.ack_expiration_padding_ms
            && value > 0
        {
            config.ack_expiration_padding = Duration::from_millis(value);
        }
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.max_outstanding_messages = value;
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.max_outstanding_bytes = value;
        }
        if let Some(value) = self.outbound_queue_depth
            && value > 0
        {
            config.outbound_queue_depth = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
