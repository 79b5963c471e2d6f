// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS connection management
//!
//! The initial connect is retried a bounded number of times with exponential
//! backoff. Once connected, `async_nats` reconnects on its own and reports
//! connection events through a callback. The callback only forwards events to
//! a channel; one dedicated task drains it and re-verifies the stream, so
//! verifications never overlap.
//!
//! ```text
//! async_nats event_callback ──> mpsc ──> reconnect handler ──> StreamManager::ensure_stream
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::JetStreamBackend;
use crate::broker::JetStreamBroker;
use crate::config::{BackendConfig, NatsConfig};
use crate::dispatcher::HttpSender;
use crate::errors::{BackendError, BackendResult};
use crate::jetstream::NatsBroker;
use crate::metrics::Collector;
use crate::stream::{stream_settings, StreamManager};

/// Upper bound of the wait between connect attempts
pub const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Connection changes relevant to the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Wait before connect attempt `attempt + 1`, doubling from `base`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_CONNECT_BACKOFF)
}

/// Connect to NATS, retrying up to `config.connect_attempts` times
///
/// Connection events of the resulting client are sent to `events`.
pub async fn connect(
    config: &NatsConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> BackendResult<Client> {
    let attempts = config.connect_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match async_nats::connect_with_options(&config.url, connect_options(config, events.clone()))
            .await
        {
            Ok(client) => {
                info!(url = %config.url, attempt, "Connected to NATS");
                return Ok(client);
            }
            Err(e) if (attempt as usize) < attempts => {
                let delay = backoff_delay(config.reconnect_wait, attempt);
                warn!(url = %config.url, attempt, error = %e, ?delay, "Failed to connect to NATS, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(BackendError::ConnectFailed(format!(
                    "failed to connect to {} after {} attempts: {}",
                    config.url, attempt, e
                )));
            }
        }
    }
}

fn connect_options(
    config: &NatsConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectOptions {
    let reconnect_wait = config.reconnect_wait;
    ConnectOptions::new()
        .name(&config.name)
        .connection_timeout(config.connect_timeout)
        .request_timeout(Some(config.request_timeout))
        .max_reconnects(Some(config.max_reconnects))
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(move |event| {
            let events = events.clone();
            async move {
                let forwarded = match event {
                    Event::Connected => Some(ConnectionEvent::Connected),
                    Event::Disconnected => Some(ConnectionEvent::Disconnected),
                    other => {
                        debug!(event = ?other, "NATS connection event");
                        None
                    }
                };
                if let Some(forwarded) = forwarded {
                    // The receiver is gone only during shutdown.
                    let _ = events.send(forwarded);
                }
            }
        })
}

/// Drain connection events and re-verify the stream after each reconnect
pub fn spawn_reconnect_handler<B: JetStreamBroker>(
    stream: Arc<StreamManager<B>>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => {
                    info!(stream = %stream.stream_name(), "Called reconnect handler for JetStream");
                    if let Err(e) = stream.ensure_stream().await {
                        error!(stream = %stream.stream_name(), error = %e, "Failed to ensure the stream exists");
                    }
                }
                ConnectionEvent::Disconnected => {
                    warn!(stream = %stream.stream_name(), "Disconnected from NATS");
                    stream.mark_disconnected().await;
                }
            }
        }
    })
}

/// A connected, initialized backend and its reconnect handler
pub struct ConnectedBackend {
    pub backend: Arc<JetStreamBackend<NatsBroker>>,
    pub reconnect_handler: JoinHandle<()>,
}

/// Validate, connect, verify the stream and start reconnect handling
pub async fn connect_backend(
    config: &BackendConfig,
    metrics: Arc<Collector>,
) -> BackendResult<ConnectedBackend> {
    stream_settings(&config.stream)?;

    let (events, receiver) = mpsc::unbounded_channel();
    let client = connect(&config.nats, events).await?;
    let broker = Arc::new(NatsBroker::new(client));
    let sender = Arc::new(HttpSender::new(config.dispatch.sink_timeout)?);

    let backend = Arc::new(JetStreamBackend::new(broker, config, sender, metrics)?);
    backend.initialize().await?;
    let reconnect_handler =
        spawn_reconnect_handler(Arc::clone(backend.stream_manager()), receiver);

    Ok(ConnectedBackend {
        backend,
        reconnect_handler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::memory::InMemoryBroker;
    use crate::stream::StreamState;
    use test_case::test_case;

    #[test_case(1, 1)]
    #[test_case(2, 2)]
    #[test_case(3, 4)]
    #[test_case(4, 8)]
    fn test_backoff_doubles(attempt: u32, seconds: u64) {
        assert_eq!(
            backoff_delay(Duration::from_secs(1), attempt),
            Duration::from_secs(seconds)
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(Duration::from_secs(1), 40), MAX_CONNECT_BACKOFF);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let config = NatsConfig {
            url: "nats://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(200),
            reconnect_wait: Duration::from_millis(10),
            connect_attempts: 2,
            ..Default::default()
        };
        let (events, _receiver) = mpsc::unbounded_channel();
        let result = connect(&config, events).await;
        assert!(matches!(result, Err(BackendError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_reconnect_recreates_lost_stream() {
        let broker = Arc::new(InMemoryBroker::new());
        let stream = Arc::new(StreamManager::new(broker.clone(), &StreamConfig::default()).unwrap());
        stream.ensure_stream().await.unwrap();

        let (events, receiver) = mpsc::unbounded_channel();
        let handler = spawn_reconnect_handler(stream.clone(), receiver);

        broker.remove_stream("eventing");
        events.send(ConnectionEvent::Disconnected).unwrap();
        events.send(ConnectionEvent::Connected).unwrap();
        drop(events);
        handler.await.unwrap();

        assert!(broker.stream("eventing").is_some());
        assert_eq!(stream.state().await, StreamState::StreamVerified);
        assert_eq!(broker.calls().add_stream, 2);
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_in_flight_operations() {
        let broker = Arc::new(InMemoryBroker::new());
        let stream = Arc::new(StreamManager::new(broker.clone(), &StreamConfig::default()).unwrap());
        stream.ensure_stream().await.unwrap();
        broker.remove_stream("eventing");

        let (events, receiver) = mpsc::unbounded_channel();
        let handler = spawn_reconnect_handler(stream.clone(), receiver);

        // An in-flight synchronizer operation holds the gate
        let guard = stream.stable().await;
        events.send(ConnectionEvent::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.calls().add_stream, 1);
        assert!(broker.stream("eventing").is_none());

        drop(guard);
        drop(events);
        handler.await.unwrap();

        assert_eq!(broker.calls().add_stream, 2);
        assert_eq!(stream.state().await, StreamState::StreamVerified);
    }
}
