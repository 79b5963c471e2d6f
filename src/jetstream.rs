// Copyright (c) 2025 - Cowboy AI, Inc.

//! JetStream broker over `async_nats`
//!
//! [`NatsBroker`] implements [`JetStreamBroker`] with the JetStream API of an
//! established NATS connection. Consumers are durable push consumers with
//! explicit acks; every delivered message is handled on its own task.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventing_jetstream::broker::JetStreamBroker;
//! use eventing_jetstream::jetstream::NatsBroker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = async_nats::connect("nats://localhost:4222").await?;
//!     let broker = NatsBroker::new(client);
//!
//!     let stream = broker.stream_info("eventing").await?;
//!     println!("stream present: {}", stream.is_some());
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::consumer::{self, push, AckPolicy, ReplayPolicy};
use async_nats::jetstream::context::GetStreamErrorKind;
use async_nats::jetstream::stream::{self, ConsumerErrorKind, Stream};
use async_nats::jetstream::{self, AckKind, ErrorCode};
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{
    AckableMessage, ConsumerInfo, ConsumerSettings, DeliverPolicy, DiscardPolicy,
    JetStreamBroker, MessageHandler, RetentionPolicy, StorageType, StreamSettings, Subscriber,
};
use crate::errors::{BackendError, BackendResult};

/// JetStream broker bound to one NATS client
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    context: jetstream::Context,
}

impl NatsBroker {
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn stream(&self, name: &str) -> Result<Stream, String> {
        self.context.get_stream(name).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl JetStreamBroker for NatsBroker {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn stream_info(&self, stream: &str) -> BackendResult<Option<StreamSettings>> {
        match self.context.get_stream(stream).await {
            Ok(stream) => Ok(Some(from_stream_config(&stream.cached_info().config))),
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(e) if e.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                    Ok(None)
                }
                _ => Err(BackendError::StreamInfoFailed(err.to_string())),
            },
        }
    }

    async fn add_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings> {
        let stream = self
            .context
            .create_stream(to_stream_config(settings))
            .await
            .map_err(|e| BackendError::StreamAddFailed(e.to_string()))?;
        Ok(from_stream_config(&stream.cached_info().config))
    }

    async fn update_stream(&self, settings: &StreamSettings) -> BackendResult<StreamSettings> {
        let info = self
            .context
            .update_stream(&to_stream_config(settings))
            .await
            .map_err(|e| BackendError::StreamUpdateFailed(e.to_string()))?;
        Ok(from_stream_config(&info.config))
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> BackendResult<Option<ConsumerInfo>> {
        let get_failed = |reason: String| BackendError::ConsumerGetFailed {
            consumer: consumer.to_string(),
            reason,
        };
        let stream = self.stream(stream).await.map_err(get_failed)?;
        match stream.get_consumer::<push::Config>(consumer).await {
            Ok(mut handle) => {
                let info = handle.info().await.map_err(|e| get_failed(e.to_string()))?;
                Ok(Some(from_consumer_info(info)))
            }
            Err(err) => match err.kind() {
                ConsumerErrorKind::JetStream(e) if e.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
                    Ok(None)
                }
                _ => Err(get_failed(err.to_string())),
            },
        }
    }

    async fn add_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo> {
        let add_failed = |reason: String| BackendError::ConsumerAddFailed {
            consumer: settings.durable_name.clone(),
            reason,
        };
        let stream = self.stream(stream).await.map_err(add_failed)?;
        let mut handle = stream
            .create_consumer(to_push_config(settings))
            .await
            .map_err(|e| add_failed(e.to_string()))?;
        let info = handle.info().await.map_err(|e| add_failed(e.to_string()))?;
        Ok(from_consumer_info(info))
    }

    // A create request for an existing durable consumer updates its editable fields.
    async fn update_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> BackendResult<ConsumerInfo> {
        let update_failed = |reason: String| BackendError::ConsumerUpdateFailed {
            consumer: settings.durable_name.clone(),
            reason,
        };
        let stream = self.stream(stream).await.map_err(update_failed)?;
        let mut handle = stream
            .create_consumer(to_push_config(settings))
            .await
            .map_err(|e| update_failed(e.to_string()))?;
        let info = handle.info().await.map_err(|e| update_failed(e.to_string()))?;
        Ok(from_consumer_info(info))
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> BackendResult<bool> {
        let delete_failed = |reason: String| BackendError::ConsumerDeleteFailed {
            consumer: consumer.to_string(),
            reason,
        };
        let stream = self.stream(stream).await.map_err(delete_failed)?;
        match stream.delete_consumer(consumer).await {
            Ok(_) => Ok(true),
            Err(err) => match err.kind() {
                ConsumerErrorKind::JetStream(e) if e.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
                    Ok(false)
                }
                _ => Err(delete_failed(err.to_string())),
            },
        }
    }

    async fn consumers(&self, stream: &str) -> BackendResult<Vec<ConsumerInfo>> {
        let stream = self
            .stream(stream)
            .await
            .map_err(BackendError::ConsumerListFailed)?;
        let consumers = stream.consumers();
        tokio::pin!(consumers);

        let mut result = Vec::new();
        while let Some(info) = consumers.next().await {
            let info = info.map_err(|e| BackendError::ConsumerListFailed(e.to_string()))?;
            result.push(from_consumer_info(&info));
        }
        Ok(result)
    }

    async fn subscribe(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BackendResult<Box<dyn Subscriber>> {
        let subscribe_failed = |reason: String| BackendError::SubscribeFailed {
            subject: consumer.to_string(),
            reason,
        };
        let stream = self.stream(stream).await.map_err(subscribe_failed)?;
        let handle = stream
            .get_consumer::<push::Config>(consumer)
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;
        let subject = handle.cached_info().config.filter_subject.clone();
        let messages = handle
            .messages()
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;

        let valid = Arc::new(AtomicBool::new(true));
        let task_valid = Arc::clone(&valid);
        let consumer_name = consumer.to_string();
        let task = tokio::spawn(async move {
            tokio::pin!(messages);
            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(Box::new(NatsMessage { message })).await;
                        });
                    }
                    Err(e) => {
                        warn!(consumer = %consumer_name, error = %e, "Push subscription failed");
                        break;
                    }
                }
            }
            task_valid.store(false, Ordering::SeqCst);
            debug!(consumer = %consumer_name, "Push subscription ended");
        });

        Ok(Box::new(NatsSubscriber {
            subject,
            consumer_name: consumer.to_string(),
            valid,
            task,
        }))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }
}

/// Push subscription driven by a background task
#[derive(Debug)]
pub struct NatsSubscriber {
    subject: String,
    consumer_name: String,
    valid: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Subscriber for NatsSubscriber {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn unsubscribe(&self) -> BackendResult<()> {
        self.task.abort();
        self.valid.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for NatsSubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct NatsMessage {
    message: jetstream::Message,
}

#[async_trait]
impl AckableMessage for NatsMessage {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> BackendResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BackendError::AckFailed(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> BackendResult<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BackendError::AckFailed(e.to_string()))
    }
}

fn to_stream_config(settings: &StreamSettings) -> stream::Config {
    stream::Config {
        name: settings.name.clone(),
        subjects: settings.subjects.clone(),
        storage: match settings.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        num_replicas: settings.replicas,
        retention: match settings.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        discard: match settings.discard {
            DiscardPolicy::New => stream::DiscardPolicy::New,
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
        },
        max_messages: settings.max_messages,
        max_bytes: settings.max_bytes,
        max_messages_per_subject: settings.max_messages_per_subject,
        ..Default::default()
    }
}

fn from_stream_config(config: &stream::Config) -> StreamSettings {
    StreamSettings {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            stream::StorageType::File => StorageType::File,
            stream::StorageType::Memory => StorageType::Memory,
        },
        replicas: config.num_replicas,
        retention: match config.retention {
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        },
        discard: match config.discard {
            stream::DiscardPolicy::New => DiscardPolicy::New,
            stream::DiscardPolicy::Old => DiscardPolicy::Old,
        },
        max_messages: config.max_messages,
        max_bytes: config.max_bytes,
        max_messages_per_subject: config.max_messages_per_subject,
    }
}

fn to_push_config(settings: &ConsumerSettings) -> push::Config {
    push::Config {
        durable_name: Some(settings.durable_name.clone()),
        description: Some(settings.description.clone()),
        deliver_subject: settings.deliver_subject.clone(),
        filter_subject: settings.filter_subject.clone(),
        deliver_policy: match settings.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
            DeliverPolicy::LastPerSubject => consumer::DeliverPolicy::LastPerSubject,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        ack_policy: AckPolicy::Explicit,
        ack_wait: settings.ack_wait,
        max_deliver: settings.max_deliver,
        max_ack_pending: settings.max_ack_pending,
        replay_policy: ReplayPolicy::Instant,
        idle_heartbeat: settings.idle_heartbeat,
        flow_control: settings.flow_control,
        ..Default::default()
    }
}

fn from_consumer_info(info: &consumer::Info) -> ConsumerInfo {
    let config = &info.config;
    ConsumerInfo {
        name: info.name.clone(),
        config: ConsumerSettings {
            durable_name: config.durable_name.clone().unwrap_or_else(|| info.name.clone()),
            description: config.description.clone().unwrap_or_default(),
            filter_subject: config.filter_subject.clone(),
            deliver_subject: config.deliver_subject.clone().unwrap_or_default(),
            deliver_policy: match config.deliver_policy {
                consumer::DeliverPolicy::All => DeliverPolicy::All,
                consumer::DeliverPolicy::Last => DeliverPolicy::Last,
                consumer::DeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
                _ => DeliverPolicy::New,
            },
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            max_ack_pending: config.max_ack_pending,
            idle_heartbeat: config.idle_heartbeat,
            flow_control: config.flow_control,
        },
        push_bound: info.push_bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings() -> StreamSettings {
        StreamSettings {
            name: "eventing".into(),
            subjects: vec!["kyma.>".into()],
            storage: StorageType::Memory,
            replicas: 3,
            retention: RetentionPolicy::Interest,
            discard: DiscardPolicy::New,
            max_messages: -1,
            max_bytes: 734003200,
            max_messages_per_subject: -1,
        }
    }

    #[test]
    fn test_stream_config_keeps_owned_fields() {
        let config = to_stream_config(&settings());
        assert_eq!(config.num_replicas, 3);
        assert_eq!(config.max_bytes, 734003200);
        assert_eq!(from_stream_config(&config), settings());
    }

    #[test]
    fn test_push_config_is_explicit_ack() {
        let consumer = ConsumerSettings {
            durable_name: "c0ffee".into(),
            description: "ns1/sub1/kyma.app1.a.b".into(),
            filter_subject: "kyma.app1.a.b".into(),
            deliver_subject: "_INBOX.abc".into(),
            deliver_policy: DeliverPolicy::New,
            ack_wait: Duration::from_secs(30),
            max_deliver: 100,
            max_ack_pending: 10,
            idle_heartbeat: Duration::from_secs(60),
            flow_control: true,
        };
        let config = to_push_config(&consumer);
        assert_eq!(config.durable_name.as_deref(), Some("c0ffee"));
        assert!(matches!(config.ack_policy, AckPolicy::Explicit));
        assert_eq!(config.max_ack_pending, 10);
        assert!(config.flow_control);
    }
}
