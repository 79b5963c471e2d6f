// Copyright (c) 2025 - Cowboy AI, Inc.

//! NATS subjects and consumer identifiers for subscriptions
//!
//! Every event type of a subscription maps to one subject in the stream and
//! one durable consumer on the broker.
//!
//! # Subject Pattern
//!
//! ```text
//! {prefix}.{clean source}.{clean type}     (standard type matching)
//! {prefix}.{type}                          (exact type matching)
//! ```
//!
//! # Consumer Names
//!
//! Consumer names are the hex MD5 of `namespace/name/subject`. They are
//! computable from the subscription alone, so consumers can be found and
//! deleted after a restart lost the in-memory registry.
//!
//! ```rust
//! use eventing_jetstream::subject::SubscriptionSubjectIdentifier;
//!
//! let id = SubscriptionSubjectIdentifier::new("ns1", "sub1", "kyma.app1.order.created.v1");
//! assert_eq!(id.consumer_name().len(), 32);
//! assert_eq!(id.namespaced_name(), "ns1/sub1");
//! ```

use std::fmt;

use md5::{Digest, Md5};

use crate::cleaner::Cleaner;
use crate::errors::BackendResult;
use crate::subscription::TypeMatching;

/// Separator between namespace, name and subject in identifiers
pub const SEPARATOR: &str = "/";

/// Length of every consumer name (hex encoded MD5)
pub const CONSUMER_NAME_LENGTH: usize = 32;

/// Build the stream subject for one event type
///
/// With [`TypeMatching::Exact`] the type is used verbatim under the prefix;
/// otherwise the cleaned source is inserted between prefix and type.
pub fn build_subject(
    prefix: &str,
    source: &str,
    clean_type: &str,
    type_matching: TypeMatching,
    cleaner: &dyn Cleaner,
) -> BackendResult<String> {
    match type_matching {
        TypeMatching::Exact => Ok(format!("{}.{}", prefix, clean_type)),
        TypeMatching::Standard => {
            let clean_source = cleaner.clean_source(source)?;
            Ok(format!("{}.{}.{}", prefix, clean_source, clean_type))
        }
    }
}

/// Wildcard subject the stream captures: `{prefix}.>`
pub fn stream_subject(prefix: &str) -> String {
    format!("{}.>", prefix)
}

/// Uniquely identifies one subject of one subscription
///
/// Equality covers namespace, name and subject: the namespaced string holds
/// all three, and Kubernetes names never contain the separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSubjectIdentifier {
    consumer_name: String,
    namespaced_subject_name: String,
}

impl SubscriptionSubjectIdentifier {
    /// Compute the identifier for a subscription subject
    pub fn new(namespace: &str, name: &str, subject: &str) -> Self {
        let namespaced_subject_name = [namespace, name, subject].join(SEPARATOR);
        let consumer_name = compute_consumer_name(&namespaced_subject_name);
        Self {
            consumer_name,
            namespaced_subject_name,
        }
    }

    /// Durable consumer name on the broker
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Human readable `namespace/name/subject`
    pub fn namespaced_subject_name(&self) -> &str {
        &self.namespaced_subject_name
    }

    /// `namespace/name` of the owning subscription
    pub fn namespaced_name(&self) -> &str {
        match self.subject_offset() {
            Some(offset) => &self.namespaced_subject_name[..offset - SEPARATOR.len()],
            None => &self.namespaced_subject_name,
        }
    }

    /// The NATS subject
    pub fn subject(&self) -> &str {
        match self.subject_offset() {
            Some(offset) => &self.namespaced_subject_name[offset..],
            None => "",
        }
    }

    /// Whether this identifier belongs to the subscription with `key`
    pub fn belongs_to(&self, key: &str) -> bool {
        self.namespaced_name() == key
    }

    // The subject starts after the second separator; it may itself contain one.
    fn subject_offset(&self) -> Option<usize> {
        self.namespaced_subject_name
            .match_indices(SEPARATOR)
            .nth(1)
            .map(|(idx, sep)| idx + sep.len())
    }
}

impl fmt::Display for SubscriptionSubjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.namespaced_subject_name, self.consumer_name)
    }
}

fn compute_consumer_name(namespaced_subject_name: &str) -> String {
    hex::encode(Md5::digest(namespaced_subject_name.as_bytes()))
}
