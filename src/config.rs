// Copyright (c) 2025 - Cowboy AI, Inc.
//! Backend configuration
//!
//! All settings are read once at startup, usually from the environment via
//! [`BackendConfig::from_env`]. Stream enums are kept as strings here and
//! validated by [`crate::stream::StreamManager`], so each bad value surfaces
//! as its own [`crate::errors::StreamConfigError`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::cleaner::{Cleaner, PermissiveCleaner, StrictCleaner};
use crate::errors::{BackendError, BackendResult, StreamConfigError};

/// Ack wait of every consumer
pub const CONSUMER_ACK_WAIT: Duration = Duration::from_secs(30);

/// Deliveries before the broker gives up on a message
pub const CONSUMER_MAX_DELIVER: i64 = 100;

/// Heartbeat interval of idle push consumers
pub const IDLE_HEARTBEAT: Duration = Duration::from_secs(60);

/// Redelivery delay after a failed dispatch
pub const NAK_DELAY: Duration = Duration::from_secs(30);

/// Configuration for the NATS connection
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Client name
    pub name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
    /// Reconnect attempts after an established connection drops
    pub max_reconnects: usize,
    /// Wait between reconnect attempts
    pub reconnect_wait: Duration,
    /// Attempts for the initial connect
    pub connect_attempts: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: "eventing-jetstream".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(1),
            connect_attempts: 5,
        }
    }
}

/// Stream settings as configured
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    /// Prefix of every subject; the stream captures `{prefix}.>`
    pub subject_prefix: String,
    /// `file` or `memory`
    pub storage_type: String,
    pub replicas: usize,
    /// `limits` or `interest`
    pub retention_policy: String,
    /// `new` or `old`
    pub discard_policy: String,
    pub max_messages: i64,
    /// Byte quantity such as `-1`, `700Mi` or `1G`
    pub max_bytes: String,
    pub max_messages_per_subject: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "eventing".to_string(),
            subject_prefix: "kyma".to_string(),
            storage_type: "memory".to_string(),
            replicas: 1,
            retention_policy: "interest".to_string(),
            discard_policy: "new".to_string(),
            max_messages: -1,
            max_bytes: "-1".to_string(),
            max_messages_per_subject: -1,
        }
    }
}

/// Settings applied to every consumer the backend creates
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// `all`, `last`, `last_per_subject` or `new`
    pub deliver_policy: String,
    /// Max in-flight messages for subscriptions that do not set one
    pub default_max_in_flight: i64,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub idle_heartbeat: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            deliver_policy: "new".to_string(),
            default_max_in_flight: 10,
            ack_wait: CONSUMER_ACK_WAIT,
            max_deliver: CONSUMER_MAX_DELIVER,
            idle_heartbeat: IDLE_HEARTBEAT,
        }
    }
}

/// Settings for HTTP sink delivery
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on one delivery request
    pub sink_timeout: Duration,
    /// Delay before a failed delivery is redelivered
    pub nak_delay: Duration,
    /// Prefix of the exported metric names
    pub metrics_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sink_timeout: Duration::from_secs(30),
            nak_delay: NAK_DELAY,
            metrics_prefix: "eventing_ec".to_string(),
        }
    }
}

/// Which cleaning dialect to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanerKind {
    #[default]
    Permissive,
    Strict,
}

impl CleanerKind {
    /// Build the cleaner for this dialect
    pub fn build(self) -> Arc<dyn Cleaner> {
        match self {
            CleanerKind::Permissive => Arc::new(PermissiveCleaner),
            CleanerKind::Strict => Arc::new(StrictCleaner::default()),
        }
    }
}

impl FromStr for CleanerKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permissive" => Ok(CleanerKind::Permissive),
            "strict" => Ok(CleanerKind::Strict),
            other => Err(BackendError::Configuration(format!(
                "unknown event type cleaner {:?}",
                other
            ))),
        }
    }
}

/// Complete backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub nats: NatsConfig,
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    pub dispatch: DispatchConfig,
    pub cleaner: CleanerKind,
}

impl BackendConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BackendResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BackendConfig::default();
        let env = EnvReader { lookup };

        let nats = NatsConfig {
            url: env.string("NATS_URL", defaults.nats.url),
            name: env.string("NATS_CLIENT_NAME", defaults.nats.name),
            connect_timeout: defaults.nats.connect_timeout,
            request_timeout: defaults.nats.request_timeout,
            max_reconnects: env.parsed("MAX_RECONNECTS", defaults.nats.max_reconnects)?,
            reconnect_wait: env.duration("RECONNECT_WAIT", defaults.nats.reconnect_wait)?,
            connect_attempts: env.parsed("CONNECT_ATTEMPTS", defaults.nats.connect_attempts)?,
        };

        let stream = StreamConfig {
            name: env.string("JS_STREAM_NAME", defaults.stream.name),
            subject_prefix: env.string("JS_STREAM_SUBJECT_PREFIX", defaults.stream.subject_prefix),
            storage_type: env.string("JS_STREAM_STORAGE_TYPE", defaults.stream.storage_type),
            replicas: env.parsed("JS_STREAM_REPLICAS", defaults.stream.replicas)?,
            retention_policy: env
                .string("JS_STREAM_RETENTION_POLICY", defaults.stream.retention_policy),
            discard_policy: env.string("JS_STREAM_DISCARD_POLICY", defaults.stream.discard_policy),
            max_messages: env.parsed("JS_STREAM_MAX_MSGS", defaults.stream.max_messages)?,
            max_bytes: env.string("JS_STREAM_MAX_BYTES", defaults.stream.max_bytes),
            max_messages_per_subject: env.parsed(
                "JS_STREAM_MAX_MSGS_PER_TOPIC",
                defaults.stream.max_messages_per_subject,
            )?,
        };

        let consumer = ConsumerConfig {
            deliver_policy: env
                .string("JS_CONSUMER_DELIVER_POLICY", defaults.consumer.deliver_policy),
            default_max_in_flight: env.parsed(
                "DEFAULT_MAX_IN_FLIGHT_MESSAGES",
                defaults.consumer.default_max_in_flight,
            )?,
            ..defaults.consumer
        };

        let dispatch = DispatchConfig {
            sink_timeout: env.duration("SINK_TIMEOUT", defaults.dispatch.sink_timeout)?,
            nak_delay: env.duration("NAK_DELAY", defaults.dispatch.nak_delay)?,
            ..defaults.dispatch
        };

        let cleaner = match (env.lookup)("EVENT_TYPE_CLEANER") {
            Some(value) => value.parse()?,
            None => defaults.cleaner,
        };

        Ok(Self {
            nats,
            stream,
            consumer,
            dispatch,
            cleaner,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: String) -> String {
        (self.lookup)(key).unwrap_or(default)
    }

    fn parsed<T>(&self, key: &str, default: T) -> BackendResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| BackendError::Configuration(format!("{}={:?}: {}", key, value, e))),
            None => Ok(default),
        }
    }

    fn duration(&self, key: &str, default: Duration) -> BackendResult<Duration> {
        match (self.lookup)(key) {
            Some(value) => parse_duration(&value)
                .ok_or_else(|| BackendError::Configuration(format!("{}={:?}: invalid duration", key, value))),
            None => Ok(default),
        }
    }
}

/// Parse `250ms`, `30s`, `5m` or `1h`; a bare number is seconds
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(amount)),
        "" | "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        _ => None,
    }
}

/// Parse a byte quantity such as `-1`, `1024`, `700Mi` or `1G`
///
/// Binary suffixes (`Ki`..`Ei`) scale by 1024, decimal ones (`k`..`E`) by
/// 1000. An empty string means unlimited.
pub fn parse_quantity(value: &str) -> Result<i64, StreamConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(-1);
    }
    let invalid = || StreamConfigError::InvalidMaxBytes(value.to_string());

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '-'))
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let amount: i64 = digits.parse().map_err(|_| invalid())?;

    let multiplier: i64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return Err(invalid()),
    };
    amount.checked_mul(multiplier).ok_or_else(invalid)
}
