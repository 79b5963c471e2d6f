// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for eventing-jetstream
//!
//! Provides an in-memory backend harness, a recording sink and deterministic
//! subscriptions and CloudEvent payloads. Only the ignored live tests need a
//! NATS server.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use eventing_jetstream::cloudevent::CloudEvent;
use eventing_jetstream::config::{BackendConfig, CleanerKind};
use eventing_jetstream::dispatcher::EventSender;
use eventing_jetstream::errors::DispatchError;
use eventing_jetstream::memory::InMemoryBroker;
use eventing_jetstream::metrics::Collector;
use eventing_jetstream::{JetStreamBackend, Subscription};

pub const NAMESPACE: &str = "ns1";
pub const NAME: &str = "sub1";
pub const SOURCE: &str = "app1";
pub const SINK: &str = "http://svc/events";
pub const ORDER_CREATED: &str = "order.created.v1";
pub const ORDER_UPDATED: &str = "order.updated.v1";
pub const EVENT_ID_1: &str = "01934f4a-0001-7000-8000-000000000001";

/// The subscription from the end-to-end scenario
pub fn order_subscription() -> Subscription {
    Subscription::new(NAMESPACE, NAME, SOURCE, vec![ORDER_CREATED.into()], SINK)
}

/// Same subscription requesting two types
pub fn order_subscription_two_types() -> Subscription {
    Subscription::new(
        NAMESPACE,
        NAME,
        SOURCE,
        vec![ORDER_CREATED.into(), ORDER_UPDATED.into()],
        SINK,
    )
}

/// Structured-mode CloudEvent as publishers put it on the stream
pub fn cloud_event_payload(prefix: &str, source: &str, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "specversion": "1.0",
        "id": EVENT_ID_1,
        "source": source,
        "type": format!("{}.{}.{}", prefix, source, event_type),
        "datacontenttype": "application/json",
        "data": {"orderId": 42}
    }))
    .unwrap()
}

/// Sink stand-in answering every event with a configurable status
pub struct RecordingSender {
    status: Mutex<u16>,
    sent: Mutex<Vec<(String, CloudEvent)>>,
}

impl RecordingSender {
    pub fn responding(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    pub fn sent(&self) -> Vec<(String, CloudEvent)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSender for RecordingSender {
    async fn send(&self, sink: &str, event: &CloudEvent) -> Result<u16, DispatchError> {
        self.sent
            .lock()
            .unwrap()
            .push((sink.to_string(), event.clone()));
        Ok(*self.status.lock().unwrap())
    }
}

/// Backend wired to an in-memory broker
pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub backend: JetStreamBackend<InMemoryBroker>,
    pub sender: Arc<RecordingSender>,
    pub metrics: Arc<Collector>,
}

impl Harness {
    /// A second backend on the same broker, as after a process restart
    pub async fn restarted(&self) -> JetStreamBackend<InMemoryBroker> {
        let backend = JetStreamBackend::new(
            self.broker.clone(),
            &BackendConfig::default(),
            self.sender.clone(),
            self.metrics.clone(),
        )
        .unwrap();
        backend.initialize().await.unwrap();
        backend
    }
}

pub async fn harness() -> Harness {
    harness_with(BackendConfig::default()).await
}

pub async fn strict_harness() -> Harness {
    let config = BackendConfig {
        cleaner: CleanerKind::Strict,
        ..Default::default()
    };
    harness_with(config).await
}

pub async fn harness_with(config: BackendConfig) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let sender = RecordingSender::responding(200);
    let metrics = Arc::new(Collector::new("eventing_ec").unwrap());
    let backend =
        JetStreamBackend::new(broker.clone(), &config, sender.clone(), metrics.clone()).unwrap();
    backend.initialize().await.unwrap();
    Harness {
        broker,
        backend,
        sender,
        metrics,
    }
}
