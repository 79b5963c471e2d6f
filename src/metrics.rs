// Copyright (c) 2025 - Cowboy AI, Inc.

//! Prometheus metrics for event delivery
//!
//! # Metrics Overview
//!
//! ## Counters
//! - `{prefix}_nats_delivery_per_subscription_total` - Deliveries by response code
//!
//! ## Histograms
//! - `{prefix}_nats_subscriber_dispatch_duration_seconds` - Sink round-trip latency
//!
//! ## Gauges
//! - `{prefix}_event_type_subscribed_total` - Event types with a live consumer
//!
//! # Example
//!
//! ```rust
//! use eventing_jetstream::metrics::Collector;
//!
//! let metrics = Collector::new("eventing_ec").unwrap();
//! metrics.record_delivery_per_subscription("sub1", "order.created.v1", "http://svc", 200);
//! assert!(metrics.render().unwrap().contains("eventing_ec_nats_delivery_per_subscription_total"));
//! ```

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const DELIVERY_LABELS: &[&str] = &["subscription_name", "event_type", "sink", "response_code"];
const EVENT_TYPE_LABELS: &[&str] = &[
    "subscription_name",
    "subscription_namespace",
    "event_type",
    "consumer_name",
];

/// Delivery and subscription metrics with their own registry
pub struct Collector {
    registry: Registry,
    deliveries: IntCounterVec,
    latency: HistogramVec,
    event_types: IntGaugeVec,
}

impl Collector {
    /// Create the collector, prefixing every metric name with `prefix`
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let deliveries = IntCounterVec::new(
            Opts::new(
                format!("{}_nats_delivery_per_subscription_total", prefix),
                "Number of dispatched events per subscription and response code",
            ),
            DELIVERY_LABELS,
        )?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_nats_subscriber_dispatch_duration_seconds", prefix),
                "Duration of sending an event to its sink",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            DELIVERY_LABELS,
        )?;

        let event_types = IntGaugeVec::new(
            Opts::new(
                format!("{}_event_type_subscribed_total", prefix),
                "Event types subscribed through a JetStream consumer",
            ),
            EVENT_TYPE_LABELS,
        )?;

        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(event_types.clone()))?;

        Ok(Self {
            registry,
            deliveries,
            latency,
            event_types,
        })
    }

    /// Count one delivery attempt
    pub fn record_delivery_per_subscription(
        &self,
        subscription_name: &str,
        event_type: &str,
        sink: &str,
        status: u16,
    ) {
        let status = status.to_string();
        self.deliveries
            .with_label_values(&[subscription_name, event_type, sink, &status])
            .inc();
    }

    /// Observe the sink round trip of one delivery attempt
    pub fn record_latency_per_subscription(
        &self,
        duration: Duration,
        subscription_name: &str,
        event_type: &str,
        sink: &str,
        status: u16,
    ) {
        let status = status.to_string();
        self.latency
            .with_label_values(&[subscription_name, event_type, sink, &status])
            .observe(duration.as_secs_f64());
    }

    /// Mark an event type as subscribed via `consumer_name`
    pub fn record_event_types(
        &self,
        subscription_name: &str,
        namespace: &str,
        event_type: &str,
        consumer_name: &str,
    ) {
        self.event_types
            .with_label_values(&[subscription_name, namespace, event_type, consumer_name])
            .set(1);
    }

    /// Drop the series recorded by [`Collector::record_event_types`]
    pub fn remove_event_types(
        &self,
        subscription_name: &str,
        namespace: &str,
        event_type: &str,
        consumer_name: &str,
    ) {
        // Missing series are fine: the entry may predate a restart.
        let _ = self.event_types.remove_label_values(&[
            subscription_name,
            namespace,
            event_type,
            consumer_name,
        ]);
    }

    /// Deliveries counted for one label set
    pub fn delivery_count(
        &self,
        subscription_name: &str,
        event_type: &str,
        sink: &str,
        status: u16,
    ) -> u64 {
        let status = status.to_string();
        self.deliveries
            .get_metric_with_label_values(&[subscription_name, event_type, sink, &status])
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    /// Whether a gauge series exists for the event type
    pub fn has_event_type(
        &self,
        subscription_name: &str,
        namespace: &str,
        event_type: &str,
        consumer_name: &str,
    ) -> bool {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name().ends_with("_event_type_subscribed_total"))
            .flat_map(|family| family.get_metric())
            .any(|metric| {
                let expected = [subscription_name, namespace, event_type, consumer_name];
                EVENT_TYPE_LABELS.iter().zip(expected).all(|(name, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == *name && pair.get_value() == value)
                })
            })
    }

    /// Encode all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
