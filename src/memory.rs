// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-memory JetStream broker
//!
//! Implements [`JetStreamBroker`] without a NATS server. It keeps streams,
//! consumers and push bindings in a map, counts every mutating call, and can
//! push messages into bound handlers. Tests use it to observe exactly which
//! broker operations the backend issues.
//!
//! Semantics follow JetStream where the backend relies on them:
//! - consumers need an existing stream
//! - a consumer accepts one push binding at a time
//! - deleting a consumer invalidates its binding

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{
    AckableMessage, ConsumerInfo, ConsumerSettings, JetStreamBroker, MessageHandler,
    StreamSettings, Subscriber,
};
use crate::errors::{BackendError, BackendResult};

/// Broker operations whose next call can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    StreamInfo,
    AddStream,
    UpdateStream,
    ConsumerInfo,
    AddConsumer,
    UpdateConsumer,
    DeleteConsumer,
    ListConsumers,
    Subscribe,
}

/// Number of calls per mutating operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub add_stream: usize,
    pub update_stream: usize,
    pub add_consumer: usize,
    pub update_consumer: usize,
    pub delete_consumer: usize,
    pub subscribe: usize,
}

/// Acknowledgment state of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked(Duration),
}

struct StoredConsumer {
    stream: String,
    config: ConsumerSettings,
}

struct Binding {
    handler: Arc<dyn MessageHandler>,
    valid: Arc<AtomicBool>,
}

impl Binding {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamSettings>,
    consumers: HashMap<String, StoredConsumer>,
    bindings: HashMap<String, Binding>,
    external_bindings: HashSet<String>,
    calls: CallCounts,
    failures: HashSet<BrokerOp>,
}

impl State {
    fn push_bound(&self, consumer: &str) -> bool {
        self.external_bindings.contains(consumer)
            || self.bindings.get(consumer).is_some_and(Binding::is_valid)
    }

    fn info(&self, name: &str) -> Option<ConsumerInfo> {
        self.consumers.get(name).map(|stored| ConsumerInfo {
            name: name.to_string(),
            config: stored.config.clone(),
            push_bound: self.push_bound(name),
        })
    }

    fn take_failure(&mut self, op: BrokerOp) -> Option<String> {
        self.failures
            .remove(&op)
            .then(|| format!("injected {:?} failure", op))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`JetStreamBroker`]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    connected: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: BrokerOp) {
        lock(&self.state).failures.insert(op);
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    pub fn stream(&self, name: &str) -> Option<StreamSettings> {
        lock(&self.state).streams.get(name).cloned()
    }

    /// Overwrite a stream, bypassing call accounting
    pub fn put_stream(&self, settings: StreamSettings) {
        lock(&self.state)
            .streams
            .insert(settings.name.clone(), settings);
    }

    /// Drop a stream and its consumers, as a restarted memory-backed server would
    pub fn remove_stream(&self, name: &str) {
        let mut state = lock(&self.state);
        state.streams.remove(name);
        let orphaned: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, stored)| stored.stream == name)
            .map(|(consumer, _)| consumer.clone())
            .collect();
        for consumer in orphaned {
            state.consumers.remove(&consumer);
            if let Some(binding) = state.bindings.remove(&consumer) {
                binding.valid.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn consumer(&self, name: &str) -> Option<ConsumerInfo> {
        lock(&self.state).info(name)
    }

    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).consumers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert a consumer directly, bypassing call accounting
    pub fn put_consumer(&self, stream: &str, config: ConsumerSettings) {
        lock(&self.state).consumers.insert(
            config.durable_name.clone(),
            StoredConsumer {
                stream: stream.to_string(),
                config,
            },
        );
    }

    /// Mark a consumer as bound by a client outside this process
    pub fn bind_externally(&self, consumer: &str) {
        lock(&self.state)
            .external_bindings
            .insert(consumer.to_string());
    }

    /// Simulate the broker dropping a live subscription
    pub fn drop_subscription(&self, consumer: &str) {
        if let Some(binding) = lock(&self.state).bindings.get(consumer) {
            binding.valid.store(false, Ordering::SeqCst);
        }
    }

    /// Push one message to the handler bound to `consumer`
    ///
    /// Returns `None` when nothing is bound, otherwise the ack state once the
    /// handler returned.
    pub async fn deliver(&self, consumer: &str, payload: impl Into<Vec<u8>>) -> Option<AckState> {
        let (handler, subject) = {
            let state = lock(&self.state);
            let binding = state.bindings.get(consumer).filter(|b| b.is_valid())?;
            let subject = state.consumers.get(consumer)?.config.filter_subject.clone();
            (binding.handler.clone(), subject)
        };

        let ack_state = Arc::new(Mutex::new(AckState::Pending));
        let message = MemoryMessage {
            subject,
            payload: payload.into(),
            ack_state: ack_state.clone(),
        };
        handler.handle(Box::new(message)).await;

        let outcome = *ack_state.lock().unwrap_or_else(|p| p.into_inner());
        Some(outcome)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JetStreamBroker for InMemoryBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stream_info(&self, stream: &str) -> BackendResult<Option<StreamSettings>> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.take_failure(BrokerOp::StreamInfo) {
            return Err(BackendError::StreamInfoFailed(reason));
        }
        Ok(state.streams.get(stream).cloned())
    }

    async fn add_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings> {
        let mut state = lock(&self.state);
        state.calls.add_stream += 1;
        if let Some(reason) = state.take_failure(BrokerOp::AddStream) {
            return Err(BackendError::StreamAddFailed(reason));
        }
        if state.streams.contains_key(&settings.name) {
            return Err(BackendError::StreamAddFailed(format!(
                "stream {} already exists",
                settings.name
            )));
        }
        state.streams.insert(settings.name.clone(), settings.clone());
        Ok(settings.clone())
    }

    async fn update_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings> {
        let mut state = lock(&self.state);
        state.calls.update_stream += 1;
        if let Some(reason) = state.take_failure(BrokerOp::UpdateStream) {
            return Err(BackendError::StreamUpdateFailed(reason));
        }
        if !state.streams.contains_key(&settings.name) {
            return Err(BackendError::StreamUpdateFailed(format!(
                "stream {} not found",
                settings.name
            )));
        }
        state.streams.insert(settings.name.clone(), settings.clone());
        Ok(settings.clone())
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> BackendResult<Option<ConsumerInfo>> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.take_failure(BrokerOp::ConsumerInfo) {
            return Err(BackendError::ConsumerGetFailed {
                consumer: consumer.to_string(),
                reason,
            });
        }
        let in_stream = state
            .consumers
            .get(consumer)
            .is_some_and(|stored| stored.stream == stream);
        Ok(in_stream.then(|| state.info(consumer)).flatten())
    }

    async fn add_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo> {
        let mut state = lock(&self.state);
        state.calls.add_consumer += 1;
        let name = settings.durable_name.clone();
        if let Some(reason) = state.take_failure(BrokerOp::AddConsumer) {
            return Err(BackendError::ConsumerAddFailed { consumer: name, reason });
        }
        if !state.streams.contains_key(stream) {
            return Err(BackendError::ConsumerAddFailed {
                consumer: name,
                reason: format!("stream {} not found", stream),
            });
        }
        state.consumers.insert(
            name.clone(),
            StoredConsumer {
                stream: stream.to_string(),
                config: settings.clone(),
            },
        );
        debug!(consumer = %name, "In-memory consumer added");
        state.info(&name).ok_or_else(|| BackendError::ConsumerAddFailed {
            consumer: name,
            reason: "consumer vanished".to_string(),
        })
    }

    async fn update_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo> {
        let mut state = lock(&self.state);
        state.calls.update_consumer += 1;
        let name = settings.durable_name.clone();
        if let Some(reason) = state.take_failure(BrokerOp::UpdateConsumer) {
            return Err(BackendError::ConsumerUpdateFailed { consumer: name, reason });
        }
        match state.consumers.get_mut(&name) {
            Some(stored) if stored.stream == stream => stored.config = settings.clone(),
            _ => {
                return Err(BackendError::ConsumerUpdateFailed {
                    consumer: name,
                    reason: "consumer not found".to_string(),
                })
            }
        }
        state.info(&name).ok_or_else(|| BackendError::ConsumerUpdateFailed {
            consumer: name,
            reason: "consumer vanished".to_string(),
        })
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> BackendResult<bool> {
        let mut state = lock(&self.state);
        state.calls.delete_consumer += 1;
        if let Some(reason) = state.take_failure(BrokerOp::DeleteConsumer) {
            return Err(BackendError::ConsumerDeleteFailed {
                consumer: consumer.to_string(),
                reason,
            });
        }
        let in_stream = state
            .consumers
            .get(consumer)
            .is_some_and(|stored| stored.stream == stream);
        if !in_stream {
            return Ok(false);
        }
        state.consumers.remove(consumer);
        state.external_bindings.remove(consumer);
        if let Some(binding) = state.bindings.remove(consumer) {
            binding.valid.store(false, Ordering::SeqCst);
        }
        Ok(true)
    }

    async fn consumers(&self, stream: &str) -> BackendResult<Vec<ConsumerInfo>> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.take_failure(BrokerOp::ListConsumers) {
            return Err(BackendError::ConsumerListFailed(reason));
        }
        let mut names: Vec<&String> = state
            .consumers
            .iter()
            .filter(|(_, stored)| stored.stream == stream)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names.into_iter().filter_map(|name| state.info(name)).collect())
    }

    async fn subscribe(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BackendResult<Box<dyn Subscriber>> {
        let mut state = lock(&self.state);
        state.calls.subscribe += 1;
        let subject = match state.consumers.get(consumer) {
            Some(stored) if stored.stream == stream => stored.config.filter_subject.clone(),
            _ => {
                return Err(BackendError::SubscribeFailed {
                    subject: consumer.to_string(),
                    reason: "consumer not found".to_string(),
                })
            }
        };
        if let Some(reason) = state.take_failure(BrokerOp::Subscribe) {
            return Err(BackendError::SubscribeFailed { subject, reason });
        }
        if state.push_bound(consumer) {
            return Err(BackendError::SubscribeFailed {
                subject,
                reason: "consumer is already bound to a subscription".to_string(),
            });
        }

        let valid = Arc::new(AtomicBool::new(true));
        state.bindings.insert(
            consumer.to_string(),
            Binding {
                handler,
                valid: valid.clone(),
            },
        );
        Ok(Box::new(MemorySubscriber {
            subject,
            consumer_name: consumer.to_string(),
            valid,
        }))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::now_v7().simple())
    }
}

/// Push binding handed out by [`InMemoryBroker::subscribe`]
#[derive(Debug)]
pub struct MemorySubscriber {
    subject: String,
    consumer_name: String,
    valid: Arc<AtomicBool>,
}

impl Subscriber for MemorySubscriber {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn unsubscribe(&self) -> BackendResult<()> {
        self.valid.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryMessage {
    subject: String,
    payload: Vec<u8>,
    ack_state: Arc<Mutex<AckState>>,
}

impl MemoryMessage {
    fn set(&self, new_state: AckState) {
        *self.ack_state.lock().unwrap_or_else(|p| p.into_inner()) = new_state;
    }
}

#[async_trait]
impl AckableMessage for MemoryMessage {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> BackendResult<()> {
        self.set(AckState::Acked);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> BackendResult<()> {
        self.set(AckState::Nacked(delay));
        Ok(())
    }
}
