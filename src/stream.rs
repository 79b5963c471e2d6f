// Copyright (c) 2025 - Cowboy AI, Inc.

//! Stream management
//!
//! One stream per backend captures every subject under the configured prefix.
//! [`StreamManager::ensure_stream`] creates it on first run and reconciles
//! drift afterwards; it runs on initialize and again after every reconnect.
//!
//! # State Machine
//!
//! ```text
//! Unconnected ──connect──> Connected ──ensure_stream──> StreamVerified
//!      ^                       │                            │
//!      └──── ensure failed ────┴──────── reconnect ─────────┘
//! ```
//!
//! # Stability Gate
//!
//! Stream verification holds the write side of an `RwLock`; synchronizer
//! operations hold the read side, so a reconnect never reconfigures the
//! stream underneath an in-flight consumer creation.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::broker::{DiscardPolicy, JetStreamBroker, RetentionPolicy, StorageType, StreamSettings};
use crate::config::{parse_quantity, StreamConfig};
use crate::errors::{BackendResult, StreamConfigError};
use crate::subject::stream_subject;

/// Longest stream name the backend accepts
pub const MAX_STREAM_NAME_LENGTH: usize = 32;

/// Lifecycle of the stream as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connected,
    StreamVerified,
}

/// What [`StreamManager::ensure_stream`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Created,
    Updated,
    Unchanged,
}

/// Validate the configured stream and compute the desired settings
pub fn stream_settings(config: &StreamConfig) -> Result<StreamSettings, StreamConfigError> {
    if config.name.is_empty() {
        return Err(StreamConfigError::EmptyName);
    }
    if config.name.len() > MAX_STREAM_NAME_LENGTH {
        return Err(StreamConfigError::NameTooLong {
            name: config.name.clone(),
            max: MAX_STREAM_NAME_LENGTH,
        });
    }
    let storage: StorageType = config.storage_type.parse()?;
    let retention: RetentionPolicy = config.retention_policy.parse()?;
    let discard: DiscardPolicy = config.discard_policy.parse()?;
    let max_bytes = parse_quantity(&config.max_bytes)?;

    Ok(StreamSettings {
        name: config.name.clone(),
        subjects: vec![stream_subject(&config.subject_prefix)],
        storage,
        replicas: config.replicas,
        retention,
        discard,
        max_messages: config.max_messages,
        max_bytes,
        max_messages_per_subject: config.max_messages_per_subject,
    })
}

/// Keeps the broker's stream in line with the configured settings
pub struct StreamManager<B: JetStreamBroker> {
    broker: Arc<B>,
    settings: StreamSettings,
    state: RwLock<StreamState>,
}

impl<B: JetStreamBroker> StreamManager<B> {
    /// Validate `config` and create a manager for it
    ///
    /// Invalid configuration is rejected here, before any broker call.
    pub fn new(broker: Arc<B>, config: &StreamConfig) -> BackendResult<Self> {
        let settings = stream_settings(config)?;
        let state = if broker.is_connected() {
            StreamState::Connected
        } else {
            StreamState::Unconnected
        };
        Ok(Self {
            broker,
            settings,
            state: RwLock::new(state),
        })
    }

    /// Desired stream settings
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn stream_name(&self) -> &str {
        &self.settings.name
    }

    /// Current lifecycle state
    pub async fn state(&self) -> StreamState {
        *self.state.read().await
    }

    /// Hold off stream reconfiguration for as long as the guard lives
    pub async fn stable(&self) -> RwLockReadGuard<'_, StreamState> {
        self.state.read().await
    }

    /// Record that the connection dropped
    pub async fn mark_disconnected(&self) {
        *self.state.write().await = StreamState::Unconnected;
    }

    /// Create the stream if absent, update it if it drifted
    ///
    /// A failure leaves the manager `Unconnected` until the next attempt.
    pub async fn ensure_stream(&self) -> BackendResult<StreamAction> {
        let mut state = self.state.write().await;
        *state = if self.broker.is_connected() {
            StreamState::Connected
        } else {
            StreamState::Unconnected
        };

        match self.reconcile().await {
            Ok(action) => {
                *state = StreamState::StreamVerified;
                Ok(action)
            }
            Err(e) => {
                *state = StreamState::Unconnected;
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> BackendResult<StreamAction> {
        let action = match self.broker.stream_info(&self.settings.name).await? {
            None => {
                let created = self.broker.add_stream(&self.settings).await?;
                info!(stream = %created.name, subjects = ?created.subjects, "Stream not found, created a new stream");
                StreamAction::Created
            }
            Some(current) if stream_is_configured_correctly(&current, &self.settings) => {
                debug!(stream = %current.name, "Reusing existing stream");
                StreamAction::Unchanged
            }
            Some(current) => {
                warn!(
                    stream = %current.name,
                    current = ?current,
                    desired = ?self.settings,
                    "Stream configuration drifted, updating"
                );
                self.broker.update_stream(&self.settings).await?;
                info!(stream = %self.settings.name, "Updated existing stream");
                StreamAction::Updated
            }
        };
        Ok(action)
    }
}

/// Field-wise comparison of the settings the backend owns
pub fn stream_is_configured_correctly(current: &StreamSettings, desired: &StreamSettings) -> bool {
    current == desired
}
