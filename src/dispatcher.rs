// Copyright (c) 2025 - Cowboy AI, Inc.
//! Delivery of stream messages to subscription sinks
//!
//! Every message the broker pushes runs through [`Dispatcher::dispatch`] on
//! its own task:
//!
//! ```text
//! message ──> sink lookup ──> CloudEvent ──> restore type ──> POST sink
//!                                                               │
//!                            2xx: ack ◄──────────────────────────┤
//!                 error / non-2xx: nak(delay) ◄──────────────────┘
//! ```
//!
//! A message without a known sink or with an undecodable payload is neither
//! acked nor nak'd; the broker redelivers it once the ack wait expires.
//! Failures never reach the synchronizer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error};

use crate::broker::{AckableMessage, MessageHandler};
use crate::cloudevent::CloudEvent;
use crate::config::DispatchConfig;
use crate::errors::{BackendError, BackendResult, DispatchError};
use crate::metrics::Collector;

/// Sink URL per subscription key (`namespace/name`)
pub type SinkTable = Arc<DashMap<String, String>>;

/// Status recorded when the sink gave no HTTP response
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

/// Sends one event to a sink and reports the HTTP status
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, sink: &str, event: &CloudEvent) -> Result<u16, DispatchError>;
}

/// [`EventSender`] over `reqwest`
pub struct HttpSender {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl EventSender for HttpSender {
    async fn send(&self, sink: &str, event: &CloudEvent) -> Result<u16, DispatchError> {
        let (headers, body) = event.to_http_parts()?;
        let mut request = self.client.post(sink).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(self.timeout)
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;
        Ok(response.status().as_u16())
    }
}

/// Resolves sinks, forwards events and settles acknowledgments
pub struct Dispatcher {
    sinks: SinkTable,
    sender: Arc<dyn EventSender>,
    metrics: Arc<Collector>,
    subject_prefix: String,
    sink_timeout: Duration,
    nak_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        sender: Arc<dyn EventSender>,
        metrics: Arc<Collector>,
        config: &DispatchConfig,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            sinks: Arc::new(DashMap::new()),
            sender,
            metrics,
            subject_prefix: subject_prefix.into(),
            sink_timeout: config.sink_timeout,
            nak_delay: config.nak_delay,
        }
    }

    pub fn sinks(&self) -> &SinkTable {
        &self.sinks
    }

    pub fn metrics(&self) -> &Arc<Collector> {
        &self.metrics
    }

    /// Message handler for one subscription
    pub fn handler(self: &Arc<Self>, key: String, subscription_name: String) -> Arc<dyn MessageHandler> {
        Arc::new(SubscriptionHandler {
            dispatcher: Arc::clone(self),
            key,
            subscription_name,
        })
    }

    /// Deliver one message of the subscription with `key`
    pub async fn dispatch(&self, key: &str, subscription_name: &str, message: &dyn AckableMessage) {
        let Some(sink) = self.sinks.get(key).map(|entry| entry.value().clone()) else {
            error!(subscription = %key, "Failed to find sink URL in storage");
            return;
        };

        let mut event = match CloudEvent::from_slice(message.payload()) {
            Ok(event) => event,
            Err(e) => {
                error!(subscription = %key, subject = %message.subject(), error = %e, "Failed to convert JetStream message to CloudEvent");
                return;
            }
        };
        event.restore_original_type(&self.subject_prefix);
        debug!(id = %event.id, source = %event.source, event_type = %event.event_type, sink = %sink, "Sending the CloudEvent");

        let start = Instant::now();
        let result = match tokio::time::timeout(self.sink_timeout, self.sender.send(&sink, &event)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.sink_timeout)),
        };
        let duration = start.elapsed();

        let status = match &result {
            Ok(status) => *status,
            Err(_) => TRANSPORT_FAILURE_STATUS,
        };
        self.metrics
            .record_delivery_per_subscription(subscription_name, &event.event_type, &sink, status);
        self.metrics.record_latency_per_subscription(
            duration,
            subscription_name,
            &event.event_type,
            &sink,
            status,
        );

        if (200..300).contains(&status) {
            if let Err(e) = message.ack().await {
                error!(id = %event.id, error = %e, "Failed to ACK an event on JetStream");
            }
            debug!(id = %event.id, sink = %sink, status, "CloudEvent was dispatched");
            return;
        }

        if let Err(e) = message.nak(self.nak_delay).await {
            error!(id = %event.id, error = %e, "Failed to NAK an event on JetStream");
        }
        match result {
            Err(e) => error!(id = %event.id, sink = %sink, error = %e, "Failed to dispatch the CloudEvent"),
            Ok(status) => error!(id = %event.id, sink = %sink, status, "Sink rejected the CloudEvent"),
        }
    }
}

struct SubscriptionHandler {
    dispatcher: Arc<Dispatcher>,
    key: String,
    subscription_name: String,
}

#[async_trait]
impl MessageHandler for SubscriptionHandler {
    async fn handle(&self, message: Box<dyn AckableMessage>) {
        self.dispatcher
            .dispatch(&self.key, &self.subscription_name, message.as_ref())
            .await;
    }
}
