// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Subscription Subject Identifiers
//!
//! Consumer names are derived from `namespace/name/subject` only, so the same
//! subscription always finds the same consumers.

use eventing_jetstream::cleaner::PermissiveCleaner;
use eventing_jetstream::subject::{build_subject, SubscriptionSubjectIdentifier, CONSUMER_NAME_LENGTH};
use eventing_jetstream::TypeMatching;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Kubernetes-style names
fn k8s_name() -> impl Strategy<Value = String> {
    "[a-z0-9]([a-z0-9-]{0,18}[a-z0-9])?"
}

/// Subjects, which may contain the identifier separator
fn subject() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9./_-]{0,40}"
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Same input, same consumer name
    #[test]
    fn prop_consumer_name_is_deterministic(ns in k8s_name(), name in k8s_name(), subject in subject()) {
        let first = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        let second = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        prop_assert_eq!(first.consumer_name(), second.consumer_name());
        prop_assert_eq!(first, second);
    }

    /// Names are lowercase hex of fixed length
    #[test]
    fn prop_consumer_name_is_hex(ns in k8s_name(), name in k8s_name(), subject in subject()) {
        let id = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        prop_assert_eq!(id.consumer_name().len(), CONSUMER_NAME_LENGTH);
        prop_assert!(id
            .consumer_name()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    /// Namespace, name and subject are recovered, even when the subject holds a separator
    #[test]
    fn prop_parts_are_recovered(ns in k8s_name(), name in k8s_name(), subject in subject()) {
        let id = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        let key = format!("{}/{}", ns, name);
        prop_assert_eq!(id.namespaced_name(), key.as_str());
        prop_assert_eq!(id.subject(), subject.as_str());
        prop_assert!(id.belongs_to(&key));
    }

    /// Swapping namespace and name yields a different consumer
    #[test]
    fn prop_swapped_parts_differ(ns in k8s_name(), name in k8s_name(), subject in subject()) {
        prop_assume!(ns != name);
        let id = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        let swapped = SubscriptionSubjectIdentifier::new(&name, &ns, &subject);
        prop_assert_ne!(id.consumer_name(), swapped.consumer_name());
        prop_assert_ne!(id, swapped);
    }

    /// Different subjects of one subscription get different consumers
    #[test]
    fn prop_distinct_subjects_differ(ns in k8s_name(), name in k8s_name(), a in subject(), b in subject()) {
        prop_assume!(a != b);
        let first = SubscriptionSubjectIdentifier::new(&ns, &name, &a);
        let second = SubscriptionSubjectIdentifier::new(&ns, &name, &b);
        prop_assert_ne!(first.consumer_name(), second.consumer_name());
    }

    /// Identifiers of other subscriptions never claim this one
    #[test]
    fn prop_belongs_only_to_owner(ns in k8s_name(), name in k8s_name(), other in k8s_name(), subject in subject()) {
        prop_assume!(name != other);
        let id = SubscriptionSubjectIdentifier::new(&ns, &name, &subject);
        let other_key = format!("{}/{}", ns, other);
        prop_assert!(!id.belongs_to(&other_key));
    }

    /// Standard subjects are prefix, source and type; exact ones skip the source
    #[test]
    fn prop_subject_layout(source in "[a-z0-9]{1,10}", clean_type in "[a-z0-9]{1,8}(\\.[a-z0-9]{1,8}){1,3}") {
        let standard = build_subject("kyma", &source, &clean_type, TypeMatching::Standard, &PermissiveCleaner).unwrap();
        prop_assert_eq!(standard, format!("kyma.{}.{}", source, clean_type));
        let exact = build_subject("kyma", &source, &clean_type, TypeMatching::Exact, &PermissiveCleaner).unwrap();
        prop_assert_eq!(exact, format!("kyma.{}", clean_type));
    }
}
