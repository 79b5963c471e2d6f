// Copyright (c) 2025 - Cowboy AI, Inc.
//! Eventing Backend Service
//!
//! Connects to NATS JetStream, synchronizes the subscriptions listed in a JSON
//! file and periodically deletes consumers no subscription maps to.
//!
//! Run with: cargo run --bin eventing-backend
//!
//! Environment:
//! - `NATS_URL` and the `JS_*` stream settings (see `BackendConfig::from_env`)
//! - `SUBSCRIPTIONS_FILE`: JSON array of subscriptions (optional)
//! - `CONSUMER_GC_INTERVAL`: orphan consumer sweep interval (default `5m`)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eventing_jetstream::config::parse_duration;
use eventing_jetstream::metrics::Collector;
use eventing_jetstream::{connect_backend, BackendConfig, Subscription};
use tracing::{error, info, warn};

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn load_subscriptions(path: &Path) -> Result<Vec<Subscription>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = BackendConfig::from_env().context("Failed to load configuration")?;
    info!(
        nats_url = %config.nats.url,
        stream = %config.stream.name,
        prefix = %config.stream.subject_prefix,
        cleaner = ?config.cleaner,
        "Configuration loaded"
    );

    let gc_interval = match std::env::var("CONSUMER_GC_INTERVAL") {
        Ok(raw) => parse_duration(&raw)
            .with_context(|| format!("Invalid CONSUMER_GC_INTERVAL {:?}", raw))?,
        Err(_) => DEFAULT_GC_INTERVAL,
    };

    let subscriptions = match std::env::var("SUBSCRIPTIONS_FILE") {
        Ok(path) => load_subscriptions(Path::new(&path))?,
        Err(_) => {
            warn!("SUBSCRIPTIONS_FILE not set, starting without subscriptions");
            Vec::new()
        }
    };

    let metrics = Arc::new(
        Collector::new(&config.dispatch.metrics_prefix).context("Failed to register metrics")?,
    );
    let connected = connect_backend(&config, Arc::clone(&metrics))
        .await
        .context("Failed to initialize the JetStream backend")?;
    let backend = connected.backend;

    for subscription in &subscriptions {
        match backend.sync_subscription(subscription).await {
            Ok(types) => info!(
                subscription = %subscription.key(),
                types = types.len(),
                "Subscription synchronized"
            ),
            // Left for the next sweep; the other subscriptions still get served.
            Err(e) => error!(subscription = %subscription.key(), error = %e, "Failed to sync subscription"),
        }
    }

    let mut sweep = tokio::time::interval(gc_interval);
    sweep.tick().await;
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                for subscription in &subscriptions {
                    if let Err(e) = backend.sync_subscription(subscription).await {
                        error!(subscription = %subscription.key(), error = %e, "Failed to sync subscription");
                    }
                }
                match backend.delete_invalid_consumers(&subscriptions).await {
                    Ok(deleted) if !deleted.is_empty() => {
                        info!(count = deleted.len(), "Deleted dangling consumers")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to delete invalid consumers"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    for subscription in &subscriptions {
        if let Err(e) = backend.delete_subscription_only(subscription).await {
            warn!(subscription = %subscription.key(), error = %e, "Failed to unsubscribe");
        }
    }
    connected.reconnect_handler.abort();
    Ok(())
}
