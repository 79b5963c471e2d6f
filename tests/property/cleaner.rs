// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Subject Cleaning
//!
//! Cleaned segments must never contain characters NATS treats specially, and
//! cleaning a cleaned value must change nothing.

use eventing_jetstream::cleaner::{Cleaner, PermissiveCleaner, StrictCleaner, DEFAULT_MAX_SEGMENTS};
use proptest::prelude::*;

fn reserved(c: char) -> bool {
    c.is_whitespace() || c == '>' || c == '*'
}

/// Event types with two to six segments of arbitrary printable text
fn dotted_type() -> impl Strategy<Value = String> {
    prop::collection::vec("[ -~äöü]{1,12}", 2..=6).prop_map(|segments| segments.join("."))
}

proptest! {
    #[test]
    fn prop_permissive_strips_reserved(input in "\\PC{0,40}") {
        let source = PermissiveCleaner.clean_source(&input).unwrap();
        let event_type = PermissiveCleaner.clean_event_type(&input).unwrap();
        prop_assert!(!source.chars().any(|c| reserved(c) || c == '.'));
        prop_assert!(!event_type.chars().any(reserved));
    }

    #[test]
    fn prop_permissive_is_idempotent(input in "\\PC{0,40}") {
        let once = PermissiveCleaner.clean_event_type(&input).unwrap();
        let twice = PermissiveCleaner.clean_event_type(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_strict_source_is_alphanumeric(input in "\\PC{0,40}") {
        let source = StrictCleaner::default().clean_source(&input).unwrap();
        prop_assert!(source.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    /// Successful strict cleaning yields a bounded number of alphanumeric segments
    #[test]
    fn prop_strict_output_shape(input in dotted_type()) {
        if let Ok(cleaned) = StrictCleaner::default().clean_event_type(&input) {
            let segments: Vec<&str> = cleaned.split('.').collect();
            prop_assert!(segments.len() >= 2);
            prop_assert!(segments.len() <= DEFAULT_MAX_SEGMENTS);
            for segment in segments {
                prop_assert!(!segment.is_empty());
                prop_assert!(segment.chars().all(|c| c.is_ascii_alphanumeric()));
            }
        }
    }

    #[test]
    fn prop_strict_is_idempotent(input in dotted_type()) {
        let cleaner = StrictCleaner::default();
        if let Ok(once) = cleaner.clean_event_type(&input) {
            let twice = cleaner.clean_event_type(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }

    /// The last two segments are never merged
    #[test]
    fn prop_strict_keeps_trailing_segments(head in prop::collection::vec("[a-z]{1,6}", 1..5), event in "[a-z]{1,8}", version in "v[0-9]{1,2}") {
        let input = format!("{}.{}.{}", head.join("."), event, version);
        let cleaned = StrictCleaner::default().clean_event_type(&input).unwrap();
        let expected_suffix = format!(".{}.{}", event, version);
        prop_assert!(cleaned.ends_with(&expected_suffix));
    }
}
