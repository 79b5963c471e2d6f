// Copyright (c) 2025 - Cowboy AI, Inc.
//! Desired-state subscription model
//!
//! A [`Subscription`] is owned by the Kubernetes layer; this crate only reads
//! it. The backend computes [`EventType`]s from it and reports them back so
//! the controller can store them in the subscription status.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cleaner::Cleaner;
use crate::errors::{BackendError, BackendResult};
use crate::subject::{build_subject, SubscriptionSubjectIdentifier};

/// How requested event types are turned into subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeMatching {
    /// Use the type verbatim
    Exact,
    /// Clean the type and namespace it under the source
    #[default]
    Standard,
}

impl fmt::Display for TypeMatching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeMatching::Exact => write!(f, "exact"),
            TypeMatching::Standard => write!(f, "standard"),
        }
    }
}

/// A requested event type together with its cleaned form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventType {
    pub original_type: String,
    pub clean_type: String,
}

/// Original type paired with the consumer that serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamType {
    pub original_type: String,
    pub consumer_name: String,
}

/// Subscription to a set of event types delivered to an HTTP sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub namespace: String,
    pub name: String,
    pub source: String,
    pub types: Vec<String>,
    pub sink: String,
    #[serde(default)]
    pub type_matching: TypeMatching,
    /// Unset means the configured default applies
    #[serde(default)]
    pub max_in_flight_messages: Option<i64>,
    /// Clean types as last reported in status
    #[serde(default)]
    pub status_types: Vec<EventType>,
}

impl Subscription {
    /// Create a subscription with standard type matching and no status
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        types: Vec<String>,
        sink: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            source: source.into(),
            types,
            sink: sink.into(),
            type_matching: TypeMatching::Standard,
            max_in_flight_messages: None,
            status_types: Vec::new(),
        }
    }

    pub fn with_type_matching(mut self, type_matching: TypeMatching) -> Self {
        self.type_matching = type_matching;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: i64) -> Self {
        self.max_in_flight_messages = Some(max_in_flight);
        self
    }

    pub fn with_status_types(mut self, status_types: Vec<EventType>) -> Self {
        self.status_types = status_types;
        self
    }

    /// `namespace/name`, the key of the sink table and registry entries
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Max in-flight messages, falling back to `default`
    pub fn max_in_flight(&self, default: i64) -> i64 {
        self.max_in_flight_messages.unwrap_or(default)
    }

    /// Identifier for one subject of this subscription
    pub fn identifier(&self, subject: &str) -> SubscriptionSubjectIdentifier {
        SubscriptionSubjectIdentifier::new(&self.namespace, &self.name, subject)
    }
}

/// Compute the clean event types of a subscription
///
/// Duplicate requested types are collapsed, keeping request order. Exact type
/// matching uses types verbatim.
pub fn clean_event_types(
    subscription: &Subscription,
    cleaner: &dyn Cleaner,
) -> BackendResult<Vec<EventType>> {
    let mut seen = HashSet::new();
    let mut event_types = Vec::with_capacity(subscription.types.len());
    for original in &subscription.types {
        if !seen.insert(original.as_str()) {
            continue;
        }
        let clean_type = match subscription.type_matching {
            TypeMatching::Exact => original.clone(),
            TypeMatching::Standard => cleaner.clean_event_type(original)?,
        };
        event_types.push(EventType {
            original_type: original.clone(),
            clean_type,
        });
    }
    Ok(event_types)
}

/// Pair each event type with the consumer name its subject maps to
///
/// `subjects` must be in the same order as `event_types`.
pub fn jetstream_types(
    subscription: &Subscription,
    event_types: &[EventType],
    subjects: &[String],
) -> BackendResult<Vec<JetStreamType>> {
    if subjects.len() != event_types.len() {
        return Err(BackendError::Configuration(format!(
            "{} subjects do not match {} event types",
            subjects.len(),
            event_types.len()
        )));
    }
    Ok(event_types
        .iter()
        .zip(subjects)
        .map(|(event_type, subject)| JetStreamType {
            original_type: event_type.original_type.clone(),
            consumer_name: subscription.identifier(subject).consumer_name().to_string(),
        })
        .collect())
}

/// Subjects of the given clean types for a subscription source
pub fn subjects_for(
    prefix: &str,
    source: &str,
    clean_types: &[String],
    type_matching: TypeMatching,
    cleaner: &dyn Cleaner,
) -> BackendResult<Vec<String>> {
    clean_types
        .iter()
        .map(|clean_type| build_subject(prefix, source, clean_type, type_matching, cleaner))
        .collect()
}
