// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS broker tests against a live JetStream server
//!
//! These walk the synchronizer and dispatcher over [`NatsBroker`], so error
//! codes, push bindings and acknowledgments come from a real server.
//!
//! Run with a local server:
//!
//! ```text
//! nats-server -js &
//! cargo test --test nats_broker_tests -- --ignored
//! ```
//!
//! Every test works on its own stream and subject prefix and removes the
//! stream when it finishes.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use eventing_jetstream::broker::{AckableMessage, JetStreamBroker, MessageHandler, Subscriber};
use eventing_jetstream::config::{BackendConfig, ConsumerConfig, DispatchConfig, StreamConfig};
use eventing_jetstream::jetstream::NatsBroker;
use eventing_jetstream::metrics::Collector;
use eventing_jetstream::nats::connect;
use eventing_jetstream::stream::{StreamAction, StreamManager, StreamState};
use eventing_jetstream::{JetStreamBackend, Subscription};
use fixtures::*;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A backend on its own stream of a live server
struct LiveBackend {
    broker: Arc<NatsBroker>,
    backend: JetStreamBackend<NatsBroker>,
    sender: Arc<RecordingSender>,
    stream: String,
    prefix: String,
}

impl LiveBackend {
    fn subject(&self) -> String {
        format!("{}.{}.{}", self.prefix, SOURCE, ORDER_CREATED)
    }

    fn consumer(&self, subscription: &Subscription) -> String {
        subscription
            .identifier(&self.subject())
            .consumer_name()
            .to_string()
    }

    async fn publish_order(&self) {
        let client = self.broker.client();
        client
            .publish(
                self.subject(),
                cloud_event_payload(&self.prefix, SOURCE, ORDER_CREATED).into(),
            )
            .await
            .unwrap();
        client.flush().await.unwrap();
    }

    async fn remove_stream(self) {
        let context = async_nats::jetstream::new(self.broker.client().clone());
        let _ = context.delete_stream(&self.stream).await;
    }
}

/// Unique stream name and subject prefix
fn unique_names() -> (String, String) {
    let id = Uuid::now_v7().simple().to_string();
    let suffix = &id[id.len() - 12..];
    (format!("it{}", suffix), format!("it{}", suffix))
}

fn live_config(consumer: ConsumerConfig, dispatch: DispatchConfig) -> BackendConfig {
    let (name, subject_prefix) = unique_names();
    BackendConfig {
        stream: StreamConfig {
            name,
            subject_prefix,
            ..Default::default()
        },
        consumer,
        dispatch,
        ..Default::default()
    }
}

async fn live_broker(config: &BackendConfig) -> Arc<NatsBroker> {
    let (events, _receiver) = mpsc::unbounded_channel();
    let client = connect(&config.nats, events).await.unwrap();
    Arc::new(NatsBroker::new(client))
}

async fn live_backend_with(config: BackendConfig) -> LiveBackend {
    let broker = live_broker(&config).await;
    let sender = RecordingSender::responding(200);
    let metrics = Arc::new(Collector::new("eventing_ec").unwrap());
    let backend =
        JetStreamBackend::new(broker.clone(), &config, sender.clone(), metrics).unwrap();
    backend.initialize().await.unwrap();
    LiveBackend {
        broker,
        backend,
        sender,
        stream: config.stream.name.clone(),
        prefix: config.stream.subject_prefix.clone(),
    }
}

async fn live_backend() -> LiveBackend {
    live_backend_with(live_config(ConsumerConfig::default(), DispatchConfig::default())).await
}

/// Wait until the sink saw at least `count` events
async fn wait_for_sent(sender: &RecordingSender, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while sender.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("sink saw {} of {} events", sender.sent().len(), count));
}

/// Wait until the server reports the consumer's push binding as `bound`
async fn wait_for_push_bound(live: &LiveBackend, consumer: &str, bound: bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let info = live.broker.consumer_info(&live.stream, consumer).await.unwrap();
            if info.map(|info| info.push_bound) == Some(bound) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("consumer {} never reported push_bound={}", consumer, bound));
}

/// User Story: Stream verification against a real server
///
/// As a platform operator
/// I want the backend to create its stream once and reuse it afterwards
/// So that restarts never lose stored events
///
/// Acceptance Criteria:
/// - A missing stream is reported as absent, not as an error
/// - The first verification creates the stream
/// - Later verifications leave it unchanged
#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_stream_created_once_on_server() {
    // Given a stream name unknown to the server
    let config = live_config(ConsumerConfig::default(), DispatchConfig::default());
    let broker = live_broker(&config).await;
    assert_eq!(broker.stream_info(&config.stream.name).await.unwrap(), None);

    // When the stream is verified twice
    let manager = StreamManager::new(broker.clone(), &config.stream).unwrap();
    let first = manager.ensure_stream().await.unwrap();
    let second = manager.ensure_stream().await.unwrap();

    // Then it was created once and matches the desired settings
    assert_eq!(first, StreamAction::Created);
    assert_eq!(second, StreamAction::Unchanged);
    assert_eq!(manager.state().await, StreamState::StreamVerified);
    assert_eq!(
        broker.stream_info(&config.stream.name).await.unwrap(),
        Some(manager.settings().clone())
    );

    let context = async_nats::jetstream::new(broker.client().clone());
    context.delete_stream(&config.stream.name).await.unwrap();
}

/// User Story: End-to-end delivery over JetStream
///
/// As an application developer
/// I want events published on the stream delivered to my sink
/// So that my service reacts to them
///
/// ```mermaid
/// sequenceDiagram
///     Synchronizer->>JetStream: create consumer, bind push subscription
///     Publisher->>JetStream: publish CloudEvent
///     JetStream->>Dispatcher: push message
///     Dispatcher->>Sink: POST
///     Dispatcher->>JetStream: ack
/// ```
///
/// Acceptance Criteria:
/// - The consumer exists and the server reports it push bound
/// - The published event reaches the sink with its original type
/// - Deleting the subscription removes the consumer
#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_sync_deliver_delete_on_server() {
    // Given a synchronized subscription
    let live = live_backend().await;
    let subscription = order_subscription();
    let types = live.backend.sync_subscription(&subscription).await.unwrap();
    let consumer = live.consumer(&subscription);

    let info = live
        .broker
        .consumer_info(&live.stream, &consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.config.filter_subject, live.subject());
    wait_for_push_bound(&live, &consumer, true).await;

    // When an event is published
    live.publish_order().await;

    // Then the sink receives it
    wait_for_sent(&live.sender, 1).await;
    let sent = live.sender.sent();
    assert_eq!(sent[0].0, SINK);
    assert_eq!(sent[0].1.event_type, ORDER_CREATED);

    // And deleting the subscription removes its consumer
    live.backend
        .delete_subscription(&subscription.with_status_types(types))
        .await
        .unwrap();
    assert_eq!(
        live.broker.consumer_info(&live.stream, &consumer).await.unwrap(),
        None
    );
    assert!(!live.broker.delete_consumer(&live.stream, &consumer).await.unwrap());

    live.remove_stream().await;
}

/// User Story: Rejected events are redelivered by the server
///
/// As an application developer
/// I want events my sink rejected to come back after the nak delay
/// So that a temporary outage does not lose events
///
/// Acceptance Criteria:
/// - A non-2xx answer naks the message and the server redelivers it
/// - Once the sink accepts it, the message is acked and not redelivered
#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_nak_redelivers_then_ack_settles() {
    // Given a sink answering 500 and a short nak delay
    let config = live_config(
        ConsumerConfig {
            ack_wait: Duration::from_secs(2),
            ..Default::default()
        },
        DispatchConfig {
            nak_delay: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let live = live_backend_with(config).await;
    live.backend.sync_subscription(&order_subscription()).await.unwrap();
    live.sender.set_status(500);

    // When an event is published
    live.publish_order().await;

    // Then the server redelivers it after the nak
    wait_for_sent(&live.sender, 2).await;

    // And an accepted redelivery settles it
    live.sender.set_status(200);
    wait_for_sent(&live.sender, 3).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let settled = live.sender.sent().len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(live.sender.sent().len(), settled);

    live.remove_stream().await;
}

/// User Story: Changing max in-flight keeps the consumer
///
/// As an application developer
/// I want a new max in-flight limit applied to my existing consumer
/// So that pending messages are not dropped with a recreated consumer
///
/// Acceptance Criteria:
/// - The server reports the new max ack pending on the same consumer
/// - No second consumer appears on the stream
#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_max_in_flight_updated_in_place_on_server() {
    // Given a subscription synchronized with max in-flight 10
    let live = live_backend().await;
    let subscription = order_subscription().with_max_in_flight(10);
    live.backend.sync_subscription(&subscription).await.unwrap();
    let consumer = live.consumer(&subscription);
    let before = live
        .broker
        .consumer_info(&live.stream, &consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.config.max_ack_pending, 10);

    // When it is re-synchronized with max in-flight 20
    let subscription = order_subscription().with_max_in_flight(20);
    live.backend.sync_subscription(&subscription).await.unwrap();

    // Then the same consumer carries the new limit
    let after = live
        .broker
        .consumer_info(&live.stream, &consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.name, before.name);
    assert_eq!(after.config.max_ack_pending, 20);
    assert_eq!(after.config.deliver_subject, before.config.deliver_subject);
    assert_eq!(live.broker.consumers(&live.stream).await.unwrap().len(), 1);

    // And events still flow through it
    live.publish_order().await;
    wait_for_sent(&live.sender, 1).await;

    live.remove_stream().await;
}

#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_unknown_consumer_is_absent() {
    let live = live_backend().await;

    let info = live.broker.consumer_info(&live.stream, "0123456789abcdef").await;
    let deleted = live.broker.delete_consumer(&live.stream, "0123456789abcdef").await;

    assert_eq!(info.unwrap(), None);
    assert!(!deleted.unwrap());
    live.remove_stream().await;
}

struct Discard;

#[async_trait::async_trait]
impl MessageHandler for Discard {
    async fn handle(&self, message: Box<dyn AckableMessage>) {
        let _ = message.ack().await;
    }
}

/// Acceptance Criteria:
/// - An unsubscribed subscriber reports itself invalid
/// - The server stops reporting the consumer as push bound
/// - The consumer itself stays on the server
#[tokio::test]
#[ignore = "requires NATS server"]
async fn test_unsubscribe_releases_push_binding() {
    // Given a subscription bound to its consumer
    let live = live_backend().await;
    let subscription = order_subscription();
    live.backend.sync_subscription(&subscription).await.unwrap();
    let consumer = live.consumer(&subscription);

    // When the subscription is removed without its consumer
    live.backend.delete_subscription_only(&subscription).await.unwrap();

    // Then the server reports the consumer unbound but present
    wait_for_push_bound(&live, &consumer, false).await;

    // And a direct subscriber turns invalid once unsubscribed
    let subscriber = live
        .broker
        .subscribe(&live.stream, &consumer, Arc::new(Discard))
        .await
        .unwrap();
    assert!(subscriber.is_valid());
    subscriber.unsubscribe().unwrap();
    assert!(!subscriber.is_valid());

    live.remove_stream().await;
}
