// Copyright (c) 2025 - Cowboy AI, Inc.
//! Broker abstraction
//!
//! The synchronizer and stream manager talk to JetStream only through
//! [`JetStreamBroker`]. [`crate::jetstream::NatsBroker`] implements it on top
//! of `async_nats`; `memory::InMemoryBroker` implements it in memory for tests.
//!
//! # Architecture
//!
//! ```text
//! JetStreamBackend ──> JetStreamBroker ──> stream / consumer CRUD
//!                            │
//!                            └── subscribe(consumer, handler) ──> Subscriber
//!                                                  │
//!                                 broker pushes ──> MessageHandler::handle(AckableMessage)
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{BackendResult, StreamConfigError};

/// Storage type for the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// File-based storage (persistent across restarts)
    File,
    /// Memory-based storage (faster, but lost on restart)
    Memory,
}

impl FromStr for StorageType {
    type Err = StreamConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(StorageType::File),
            "memory" => Ok(StorageType::Memory),
            other => Err(StreamConfigError::UnknownStorageType(other.to_string())),
        }
    }
}

/// Retention policy for the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Limits-based retention (based on max messages and max bytes)
    Limits,
    /// Interest-based retention (messages kept while there are consumers)
    Interest,
    /// Work queue retention; never configured here, only reported for
    /// streams created elsewhere
    WorkQueue,
}

impl FromStr for RetentionPolicy {
    type Err = StreamConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limits" => Ok(RetentionPolicy::Limits),
            "interest" => Ok(RetentionPolicy::Interest),
            other => Err(StreamConfigError::UnknownRetentionPolicy(other.to_string())),
        }
    }
}

/// What the stream drops once a limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPolicy {
    /// Reject new messages
    New,
    /// Drop the oldest messages
    Old,
}

impl FromStr for DiscardPolicy {
    type Err = StreamConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DiscardPolicy::New),
            "old" => Ok(DiscardPolicy::Old),
            other => Err(StreamConfigError::UnknownDiscardPolicy(other.to_string())),
        }
    }
}

/// Deliver policy for consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Deliver all messages from the stream start
    All,
    /// Deliver the last message of the stream
    Last,
    /// Deliver the last message of every subject
    LastPerSubject,
    /// Deliver only new messages
    #[default]
    New,
}

impl DeliverPolicy {
    /// Parse a deliver policy, falling back to [`DeliverPolicy::New`]
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "all" => DeliverPolicy::All,
            "last" => DeliverPolicy::Last,
            "last_per_subject" => DeliverPolicy::LastPerSubject,
            "new" => DeliverPolicy::New,
            other => {
                tracing::warn!(deliver_policy = %other, "Unknown deliver policy, using \"new\"");
                DeliverPolicy::New
            }
        }
    }
}

/// Stream fields the backend owns and reconciles
///
/// Equality over this struct is the drift check: anything not listed here is
/// left to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    pub replicas: usize,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    pub max_messages: i64,
    pub max_bytes: i64,
    pub max_messages_per_subject: i64,
}

/// Durable push consumer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub durable_name: String,
    pub description: String,
    pub filter_subject: String,
    pub deliver_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
    pub idle_heartbeat: Duration,
    pub flow_control: bool,
}

/// Live state of a consumer as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub config: ConsumerSettings,
    /// Whether a client is currently bound to the consumer's deliver subject
    pub push_bound: bool,
}

/// A message pushed by the broker that must be acked or nak'd
#[async_trait]
pub trait AckableMessage: Send + Sync {
    /// Subject the message was published on
    fn subject(&self) -> &str;

    /// Raw message payload
    fn payload(&self) -> &[u8];

    /// Positive acknowledgment
    async fn ack(&self) -> BackendResult<()>;

    /// Negative acknowledgment, redelivered after `delay`
    async fn nak(&self, delay: Duration) -> BackendResult<()>;
}

/// Callback invoked once per delivered message
///
/// Invocations run concurrently; implementations must not assume ordering.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Box<dyn AckableMessage>);
}

/// A live push subscription bound to one consumer
pub trait Subscriber: Send + Sync + fmt::Debug {
    fn subject(&self) -> &str;

    fn consumer_name(&self) -> &str;

    /// False once the broker dropped the subscription or it was unsubscribed
    fn is_valid(&self) -> bool;

    /// Stop receiving messages; the consumer stays on the broker
    fn unsubscribe(&self) -> BackendResult<()>;
}

/// JetStream operations the backend depends on
///
/// Absence is not an error: lookups return `Ok(None)` and deletes report
/// whether something was removed.
#[async_trait]
pub trait JetStreamBroker: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    async fn stream_info(&self, stream: &str) -> BackendResult<Option<StreamSettings>>;

    async fn add_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings>;

    async fn update_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings>;

    async fn consumer_info(&self, stream: &str, consumer: &str)
        -> BackendResult<Option<ConsumerInfo>>;

    async fn add_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo>;

    async fn update_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo>;

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> BackendResult<bool>;

    async fn consumers(&self, stream: &str) -> BackendResult<Vec<ConsumerInfo>>;

    /// Bind a push subscription to an existing consumer
    async fn subscribe(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BackendResult<Box<dyn Subscriber>>;

    /// Fresh inbox subject for a consumer's deliveries
    fn new_inbox(&self) -> String;
}
