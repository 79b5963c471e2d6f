// Copyright (c) 2025 - Cowboy AI, Inc.
//! Subscription synchronizer
//!
//! [`JetStreamBackend`] keeps the broker's consumers and this process's push
//! subscriptions in line with the desired [`Subscription`]s. Every operation
//! is idempotent, so a reconciler can simply retry after a partial failure.
//!
//! # Sync
//!
//! ```text
//! registry entries of the subscription
//!   ├── consumer gone         ──> drop entry (recreated below)
//!   └── subject not requested ──> unsubscribe, delete consumer, drop entry
//! sink table[namespace/name] = sink
//! for each requested type:
//!   consumer info ──absent──> add consumer
//!   no entry, consumer unbound ──> subscribe
//!   invalid entry             ──> re-bind to the existing consumer
//!   max ack pending drifted   ──> update consumer
//! ```
//!
//! # Concurrency
//!
//! One mutex guards the registry for the whole of each operation. The sink
//! table is a concurrent map shared with the [`Dispatcher`]. Operations hold
//! the stream stability gate so a reconnect never reconfigures the stream
//! mid-sync.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{ConsumerInfo, ConsumerSettings, DeliverPolicy, JetStreamBroker, Subscriber};
use crate::cleaner::Cleaner;
use crate::config::{BackendConfig, ConsumerConfig};
use crate::dispatcher::{Dispatcher, EventSender};
use crate::errors::{BackendError, BackendResult};
use crate::metrics::Collector;
use crate::stream::{StreamAction, StreamManager};
use crate::subject::{build_subject, SubscriptionSubjectIdentifier};
use crate::subscription::{
    clean_event_types, jetstream_types, subjects_for, EventType, JetStreamType, Subscription,
    TypeMatching,
};

struct RegistryEntry {
    subscriber: Box<dyn Subscriber>,
    clean_type: String,
}

type Registry = HashMap<SubscriptionSubjectIdentifier, RegistryEntry>;

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSubject {
    pub identifier: SubscriptionSubjectIdentifier,
    pub valid: bool,
}

/// JetStream eventing backend
pub struct JetStreamBackend<B: JetStreamBroker> {
    broker: Arc<B>,
    stream: Arc<StreamManager<B>>,
    dispatcher: Arc<Dispatcher>,
    cleaner: Arc<dyn Cleaner>,
    consumer: ConsumerConfig,
    deliver_policy: DeliverPolicy,
    subject_prefix: String,
    registry: Mutex<Registry>,
}

impl<B: JetStreamBroker> JetStreamBackend<B> {
    /// Build the backend; invalid stream configuration fails here
    pub fn new(
        broker: Arc<B>,
        config: &BackendConfig,
        sender: Arc<dyn EventSender>,
        metrics: Arc<Collector>,
    ) -> BackendResult<Self> {
        let stream = Arc::new(StreamManager::new(Arc::clone(&broker), &config.stream)?);
        let dispatcher = Arc::new(Dispatcher::new(
            sender,
            metrics,
            &config.dispatch,
            config.stream.subject_prefix.clone(),
        ));
        Ok(Self {
            broker,
            stream,
            dispatcher,
            cleaner: config.cleaner.build(),
            consumer: config.consumer.clone(),
            deliver_policy: DeliverPolicy::parse_or_default(&config.consumer.deliver_policy),
            subject_prefix: config.stream.subject_prefix.clone(),
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn stream_manager(&self) -> &Arc<StreamManager<B>> {
        &self.stream
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Make sure the stream exists and matches the configuration
    pub async fn initialize(&self) -> BackendResult<StreamAction> {
        self.check_connection()?;
        self.stream.ensure_stream().await
    }

    /// Reconcile one subscription and return its clean event types
    pub async fn sync_subscription(&self, subscription: &Subscription) -> BackendResult<Vec<EventType>> {
        self.check_connection()?;
        let _stable = self.stream.stable().await;

        let event_types = clean_event_types(subscription, self.cleaner.as_ref())?;
        let subjects = self.subjects_of(subscription, &event_types)?;
        let key = subscription.key();

        let mut registry = self.registry.lock().await;
        self.sync_event_types(&mut registry, subscription, &subjects).await?;

        let sink_changed = self
            .dispatcher
            .sinks()
            .get(&key)
            .map_or(true, |sink| *sink != subscription.sink);
        if sink_changed {
            self.dispatcher
                .sinks()
                .insert(key.clone(), subscription.sink.clone());
        }

        let max_in_flight = subscription.max_in_flight(self.consumer.default_max_in_flight);
        for (event_type, subject) in event_types.iter().zip(&subjects) {
            let identifier = subscription.identifier(subject);
            let consumer = self
                .get_or_create_consumer(&identifier, subject, max_in_flight)
                .await?;

            match registry.get(&identifier).map(|entry| entry.subscriber.is_valid()) {
                None if !consumer.push_bound => {
                    let subscriber = self.subscribe(subscription, &identifier).await?;
                    registry.insert(
                        identifier.clone(),
                        RegistryEntry {
                            subscriber,
                            clean_type: event_type.clean_type.clone(),
                        },
                    );
                    self.dispatcher.metrics().record_event_types(
                        &subscription.name,
                        &subscription.namespace,
                        &event_type.clean_type,
                        identifier.consumer_name(),
                    );
                    info!(subscription = %key, subject = %subject, consumer = %identifier.consumer_name(), "Bound push subscription");
                }
                None => {
                    return Err(BackendError::MissingSubscription {
                        subject: subject.clone(),
                    })
                }
                Some(false) => {
                    let subscriber = self.subscribe(subscription, &identifier).await?;
                    registry.insert(
                        identifier.clone(),
                        RegistryEntry {
                            subscriber,
                            clean_type: event_type.clean_type.clone(),
                        },
                    );
                    info!(subscription = %key, subject = %subject, consumer = %identifier.consumer_name(), "Re-bound invalid subscription to existing consumer");
                }
                Some(true) => {}
            }

            self.sync_consumer_max_in_flight(&consumer, max_in_flight)
                .await?;
        }

        Ok(event_types)
    }

    /// Remove the subscription together with its consumers
    ///
    /// Consumers of the types in the last known status are deleted as well,
    /// covering entries a restart dropped from the registry.
    pub async fn delete_subscription(&self, subscription: &Subscription) -> BackendResult<()> {
        self.check_connection()?;
        let _stable = self.stream.stable().await;
        let key = subscription.key();

        let mut registry = self.registry.lock().await;
        for identifier in entries_of(&registry, &key) {
            self.delete_from_jetstream(&mut registry, subscription, &identifier)
                .await?;
        }
        drop(registry);

        for status_type in &subscription.status_types {
            let subject = self.get_jetstream_subject(
                &subscription.source,
                &status_type.clean_type,
                subscription.type_matching,
            )?;
            let identifier = subscription.identifier(&subject);
            self.delete_consumer(identifier.consumer_name()).await?;
        }

        self.dispatcher.sinks().remove(&key);
        info!(subscription = %key, "Deleted subscription");
        Ok(())
    }

    /// Unsubscribe but keep the consumers and their pending messages
    pub async fn delete_subscription_only(&self, subscription: &Subscription) -> BackendResult<()> {
        self.check_connection()?;
        let _stable = self.stream.stable().await;
        let key = subscription.key();
        info!(subscription = %key, "Delete JetStream subscription only");

        let mut registry = self.registry.lock().await;
        for identifier in entries_of(&registry, &key) {
            if let Some(entry) = registry.remove(&identifier) {
                self.unsubscribe(&entry)?;
                self.forget_event_type(subscription, &identifier, &entry);
            }
        }
        Ok(())
    }

    /// Delete unbound consumers that no subscription maps to
    ///
    /// Returns the names of the deleted consumers.
    pub async fn delete_invalid_consumers(
        &self,
        subscriptions: &[Subscription],
    ) -> BackendResult<Vec<String>> {
        self.check_connection()?;
        let _stable = self.stream.stable().await;

        let mut in_use = HashSet::new();
        for subscription in subscriptions {
            let subjects = match clean_event_types(subscription, self.cleaner.as_ref())
                .and_then(|types| self.subjects_of(subscription, &types))
            {
                Ok(subjects) => subjects,
                Err(e) => {
                    warn!(subscription = %subscription.key(), error = %e, "Skipping subscription with uncomputable subjects");
                    continue;
                }
            };
            for subject in subjects {
                in_use.insert(subscription.identifier(&subject).consumer_name().to_string());
            }
        }

        let mut deleted = Vec::new();
        for consumer in self.broker.consumers(self.stream.stream_name()).await? {
            if consumer.push_bound || in_use.contains(&consumer.name) {
                continue;
            }
            self.delete_consumer(&consumer.name).await?;
            info!(consumer = %consumer.name, description = %consumer.config.description, "Dangling JetStream consumer is deleted");
            deleted.push(consumer.name);
        }
        Ok(deleted)
    }

    /// Stream subjects for the given clean types
    pub fn get_jetstream_subjects(
        &self,
        source: &str,
        clean_types: &[String],
        type_matching: TypeMatching,
    ) -> BackendResult<Vec<String>> {
        subjects_for(
            &self.subject_prefix,
            source,
            clean_types,
            type_matching,
            self.cleaner.as_ref(),
        )
    }

    /// Stream subject for one clean type
    pub fn get_jetstream_subject(
        &self,
        source: &str,
        clean_type: &str,
        type_matching: TypeMatching,
    ) -> BackendResult<String> {
        build_subject(
            &self.subject_prefix,
            source,
            clean_type,
            type_matching,
            self.cleaner.as_ref(),
        )
    }

    /// Original types with the consumers serving them
    pub fn get_jetstream_types(&self, subscription: &Subscription) -> BackendResult<Vec<JetStreamType>> {
        let event_types = clean_event_types(subscription, self.cleaner.as_ref())?;
        let subjects = self.subjects_of(subscription, &event_types)?;
        jetstream_types(subscription, &event_types, &subjects)
    }

    /// Registry contents, ordered by namespaced subject name
    pub async fn registered_subjects(&self) -> Vec<RegisteredSubject> {
        let registry = self.registry.lock().await;
        let mut entries: Vec<RegisteredSubject> = registry
            .iter()
            .map(|(identifier, entry)| RegisteredSubject {
                identifier: identifier.clone(),
                valid: entry.subscriber.is_valid(),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.identifier
                .namespaced_subject_name()
                .cmp(b.identifier.namespaced_subject_name())
        });
        entries
    }

    /// Sink URL currently used for a subscription key
    pub fn sink(&self, key: &str) -> Option<String> {
        self.dispatcher.sinks().get(key).map(|sink| sink.value().clone())
    }

    fn check_connection(&self) -> BackendResult<()> {
        if self.broker.is_connected() {
            Ok(())
        } else {
            Err(BackendError::ConnectFailed(
                "not connected to NATS JetStream".to_string(),
            ))
        }
    }

    fn subjects_of(
        &self,
        subscription: &Subscription,
        event_types: &[EventType],
    ) -> BackendResult<Vec<String>> {
        let clean_types: Vec<String> = event_types.iter().map(|t| t.clean_type.clone()).collect();
        self.get_jetstream_subjects(&subscription.source, &clean_types, subscription.type_matching)
    }

    // Drops entries whose consumer vanished and deletes types no longer requested.
    async fn sync_event_types(
        &self,
        registry: &mut Registry,
        subscription: &Subscription,
        subjects: &[String],
    ) -> BackendResult<()> {
        let key = subscription.key();
        for identifier in entries_of(registry, &key) {
            let consumer = self
                .broker
                .consumer_info(self.stream.stream_name(), identifier.consumer_name())
                .await?;
            let requested = subjects.iter().any(|s| s == identifier.subject());

            match consumer {
                None => {
                    info!(subscription = %key, consumer = %identifier.consumer_name(), "Deleting invalid consumer");
                    if let Some(entry) = registry.remove(&identifier) {
                        if entry.subscriber.is_valid() {
                            self.unsubscribe(&entry)?;
                        }
                        self.forget_event_type(subscription, &identifier, &entry);
                    }
                }
                Some(_) if !requested => {
                    info!(
                        subscription = %key,
                        subject = %identifier.subject(),
                        "Deleting JetStream subscription because it was deleted from subscription types"
                    );
                    self.delete_from_jetstream(registry, subscription, &identifier)
                        .await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn get_or_create_consumer(
        &self,
        identifier: &SubscriptionSubjectIdentifier,
        subject: &str,
        max_in_flight: i64,
    ) -> BackendResult<ConsumerInfo> {
        let stream = self.stream.stream_name();
        if let Some(info) = self
            .broker
            .consumer_info(stream, identifier.consumer_name())
            .await?
        {
            return Ok(info);
        }

        let settings = ConsumerSettings {
            durable_name: identifier.consumer_name().to_string(),
            description: identifier.namespaced_subject_name().to_string(),
            filter_subject: subject.to_string(),
            deliver_subject: self.broker.new_inbox(),
            deliver_policy: self.deliver_policy,
            ack_wait: self.consumer.ack_wait,
            max_deliver: self.consumer.max_deliver,
            max_ack_pending: max_in_flight,
            idle_heartbeat: self.consumer.idle_heartbeat,
            flow_control: true,
        };
        let info = self.broker.add_consumer(stream, &settings).await?;
        info!(consumer = %info.name, subject = %subject, max_ack_pending = max_in_flight, "Created JetStream consumer");
        Ok(info)
    }

    async fn subscribe(
        &self,
        subscription: &Subscription,
        identifier: &SubscriptionSubjectIdentifier,
    ) -> BackendResult<Box<dyn Subscriber>> {
        let handler = self
            .dispatcher
            .handler(subscription.key(), subscription.name.clone());
        self.broker
            .subscribe(self.stream.stream_name(), identifier.consumer_name(), handler)
            .await
    }

    async fn sync_consumer_max_in_flight(
        &self,
        consumer: &ConsumerInfo,
        max_in_flight: i64,
    ) -> BackendResult<()> {
        if consumer.config.max_ack_pending == max_in_flight {
            return Ok(());
        }
        let mut settings = consumer.config.clone();
        settings.max_ack_pending = max_in_flight;
        self.broker
            .update_consumer(self.stream.stream_name(), &settings)
            .await?;
        info!(
            consumer = %consumer.name,
            from = consumer.config.max_ack_pending,
            to = max_in_flight,
            "Updated consumer max ack pending"
        );
        Ok(())
    }

    async fn delete_from_jetstream(
        &self,
        registry: &mut Registry,
        subscription: &Subscription,
        identifier: &SubscriptionSubjectIdentifier,
    ) -> BackendResult<()> {
        if let Some(entry) = registry.get(identifier) {
            if entry.subscriber.is_valid() {
                self.unsubscribe(entry)?;
            }
        }
        self.delete_consumer(identifier.consumer_name()).await?;
        if let Some(entry) = registry.remove(identifier) {
            self.forget_event_type(subscription, identifier, &entry);
        }
        Ok(())
    }

    async fn delete_consumer(&self, name: &str) -> BackendResult<()> {
        if self
            .broker
            .delete_consumer(self.stream.stream_name(), name)
            .await?
        {
            debug!(consumer = %name, "Deleted JetStream consumer");
        }
        Ok(())
    }

    fn unsubscribe(&self, entry: &RegistryEntry) -> BackendResult<()> {
        entry
            .subscriber
            .unsubscribe()
            .map_err(|e| match e {
                err @ BackendError::UnsubscribeFailed { .. } => err,
                other => BackendError::UnsubscribeFailed {
                    subject: entry.subscriber.subject().to_string(),
                    reason: other.to_string(),
                },
            })
    }

    fn forget_event_type(
        &self,
        subscription: &Subscription,
        identifier: &SubscriptionSubjectIdentifier,
        entry: &RegistryEntry,
    ) {
        self.dispatcher.metrics().remove_event_types(
            &subscription.name,
            &subscription.namespace,
            &entry.clean_type,
            identifier.consumer_name(),
        );
    }
}

fn entries_of(registry: &Registry, key: &str) -> Vec<SubscriptionSubjectIdentifier> {
    registry
        .keys()
        .filter(|identifier| identifier.belongs_to(key))
        .cloned()
        .collect()
}
