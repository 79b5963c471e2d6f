// Copyright (c) 2025 - Cowboy AI, Inc.

//! JetStream eventing backend
//!
//! Keeps declarative subscriptions (source, event types, HTTP sink, max
//! in-flight) synchronized with a NATS JetStream stream, its durable consumers
//! and live push subscriptions, and dispatches delivered messages to sinks as
//! CloudEvents with ack/nak semantics.
//!
//! # Components
//!
//! - [`cleaner`]: source and event type cleaning dialects
//! - [`subject`]: subjects and deterministic consumer names
//! - [`stream`]: stream creation and drift reconciliation
//! - [`nats`]: connection with bounded retry and reconnect handling
//! - [`backend`]: the subscription synchronizer
//! - [`dispatcher`]: delivery of messages to HTTP sinks
//!
//! The synchronizer talks to JetStream through [`broker::JetStreamBroker`],
//! implemented by [`jetstream::NatsBroker`] and, behind the `testing` feature,
//! by the in-memory broker in `memory`.

pub mod backend;
pub mod broker;
pub mod cleaner;
pub mod cloudevent;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod jetstream;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod metrics;
pub mod nats;
pub mod stream;
pub mod subject;
pub mod subscription;

// Re-export commonly used types
pub use backend::JetStreamBackend;
pub use broker::JetStreamBroker;
pub use cleaner::{Cleaner, PermissiveCleaner, StrictCleaner};
pub use config::BackendConfig;
pub use errors::{BackendError, BackendResult};
pub use nats::connect_backend;
pub use subject::SubscriptionSubjectIdentifier;
pub use subscription::{EventType, Subscription, TypeMatching};
