// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for the JetStream eventing backend

use thiserror::Error;

/// Errors that can occur in backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connecting to NATS failed, or the connection is currently down
    #[error("NATS connection error: {0}")]
    ConnectFailed(String),

    /// The configured stream cannot be created as specified
    #[error("Invalid stream configuration: {0}")]
    InvalidStreamConfig(#[from] StreamConfigError),

    /// Fetching the stream info failed for a reason other than absence
    #[error("Failed to get stream info: {0}")]
    StreamInfoFailed(String),

    /// Creating the stream failed
    #[error("Failed to add stream: {0}")]
    StreamAddFailed(String),

    /// Updating a drifted stream failed
    #[error("Failed to update stream configuration: {0}")]
    StreamUpdateFailed(String),

    /// Creating a durable consumer failed
    #[error("Failed to add consumer {consumer}: {reason}")]
    ConsumerAddFailed { consumer: String, reason: String },

    /// Fetching consumer info failed for a reason other than absence
    #[error("Failed to get consumer {consumer}: {reason}")]
    ConsumerGetFailed { consumer: String, reason: String },

    /// Updating a consumer's configuration failed
    #[error("Failed to update consumer {consumer}: {reason}")]
    ConsumerUpdateFailed { consumer: String, reason: String },

    /// Deleting a consumer failed
    #[error("Failed to delete consumer {consumer}: {reason}")]
    ConsumerDeleteFailed { consumer: String, reason: String },

    /// Listing the consumers of the stream failed
    #[error("Failed to list consumers: {0}")]
    ConsumerListFailed(String),

    /// Binding a push subscription to a consumer failed
    #[error("Failed to subscribe to {subject}: {reason}")]
    SubscribeFailed { subject: String, reason: String },

    /// Tearing down a push subscription failed
    #[error("Failed to unsubscribe from {subject}: {reason}")]
    UnsubscribeFailed { subject: String, reason: String },

    /// A consumer exists but no local subscription handle was registered for it
    #[error("Failed to create NATS JetStream subscription for subject: {subject}")]
    MissingSubscription { subject: String },

    /// An event type could not be cleaned into a valid subject segment
    #[error("Failed to clean {input:?}: {reason}")]
    CleaningFailed { input: String, reason: String },

    /// Acknowledging a delivered message failed
    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Reasons a stream configuration is rejected before it reaches the broker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamConfigError {
    #[error("stream name must not be empty")]
    EmptyName,

    #[error("stream name {name:?} exceeds the maximum length of {max} characters")]
    NameTooLong { name: String, max: usize },

    #[error("invalid stream storage type: {0:?}")]
    UnknownStorageType(String),

    #[error("invalid stream retention policy: {0:?}")]
    UnknownRetentionPolicy(String),

    #[error("invalid stream discard policy: {0:?}")]
    UnknownDiscardPolicy(String),

    #[error("invalid stream max bytes: {0:?}")]
    InvalidMaxBytes(String),
}

/// Why an event never got a response from its sink
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),
}
