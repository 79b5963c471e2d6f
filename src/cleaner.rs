// Copyright (c) 2025 - Cowboy AI, Inc.
//! Subject segment cleaning
//!
//! A subscription's source and event types are user input, but they end up as
//! segments of a NATS subject. A [`Cleaner`] turns them into characters the
//! broker accepts.
//!
//! # Dialects
//!
//! - [`PermissiveCleaner`]: strips whitespace and the wildcard characters
//!   `>` and `*`. Dots survive in event types so a type may span several
//!   subject segments.
//! - [`StrictCleaner`]: keeps ASCII alphanumerics only, requires at least two
//!   type segments and folds excess leading segments into one.
//!
//! ```rust
//! use eventing_jetstream::cleaner::{Cleaner, StrictCleaner};
//!
//! let cleaner = StrictCleaner::default();
//! assert_eq!(
//!     cleaner.clean_event_type("Account.Root.Created.v1").unwrap(),
//!     "AccountRoot.Created.v1"
//! );
//! ```

use std::fmt;

use crate::errors::{BackendError, BackendResult};

/// Separator between subject segments
pub const SEGMENT_SEPARATOR: char = '.';

/// Default segment budget of the strict dialect
pub const DEFAULT_MAX_SEGMENTS: usize = 3;

/// Minimum number of segments the strict dialect accepts in an event type
pub const MIN_SEGMENTS: usize = 2;

/// Cleaning strategy for subject segments
///
/// Implementations must be pure: the same input always yields the same
/// output.
pub trait Cleaner: Send + Sync + fmt::Debug {
    /// Clean a subscription source into a single subject segment
    fn clean_source(&self, source: &str) -> BackendResult<String>;

    /// Clean an event type into one or more subject segments
    fn clean_event_type(&self, event_type: &str) -> BackendResult<String>;
}

fn is_reserved(c: char) -> bool {
    c.is_whitespace() || c == '>' || c == '*'
}

/// Strips whitespace and broker wildcards only
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveCleaner;

impl Cleaner for PermissiveCleaner {
    fn clean_source(&self, source: &str) -> BackendResult<String> {
        Ok(source
            .chars()
            .filter(|c| !is_reserved(*c) && *c != SEGMENT_SEPARATOR)
            .collect())
    }

    fn clean_event_type(&self, event_type: &str) -> BackendResult<String> {
        Ok(event_type.chars().filter(|c| !is_reserved(*c)).collect())
    }
}

/// Keeps ASCII alphanumerics and merges excess segments
///
/// With `max_segments = 3`, `a.b.c.d.v1` becomes `abc.d.v1`: everything but
/// the last two segments is folded into the first.
#[derive(Debug, Clone, Copy)]
pub struct StrictCleaner {
    max_segments: usize,
}

impl StrictCleaner {
    /// Create a strict cleaner with a custom segment budget
    ///
    /// Budgets below three are raised to three: the two trailing segments are
    /// never merged, so a budget of two could not be honoured.
    pub fn new(max_segments: usize) -> Self {
        Self {
            max_segments: max_segments.max(MIN_SEGMENTS + 1),
        }
    }

    /// Maximum number of segments an event type is reduced to
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn clean_segment(segment: &str) -> String {
        segment.chars().filter(char::is_ascii_alphanumeric).collect()
    }
}

impl Default for StrictCleaner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEGMENTS)
    }
}

impl Cleaner for StrictCleaner {
    fn clean_source(&self, source: &str) -> BackendResult<String> {
        Ok(Self::clean_segment(source))
    }

    fn clean_event_type(&self, event_type: &str) -> BackendResult<String> {
        let segments: Vec<&str> = event_type.split(SEGMENT_SEPARATOR).collect();
        if segments.len() < MIN_SEGMENTS {
            return Err(BackendError::CleaningFailed {
                input: event_type.to_string(),
                reason: format!("event type must have at least {MIN_SEGMENTS} segments"),
            });
        }

        let mut merged: Vec<String> = Vec::with_capacity(self.max_segments);
        if segments.len() > self.max_segments {
            let head_len = segments.len() - (self.max_segments - 1);
            merged.push(segments[..head_len].concat());
            merged.extend(segments[head_len..].iter().map(|s| s.to_string()));
        } else {
            merged.extend(segments.iter().map(|s| s.to_string()));
        }

        let cleaned: Vec<String> = merged.iter().map(|s| Self::clean_segment(s)).collect();
        if cleaned.iter().any(String::is_empty) {
            return Err(BackendError::CleaningFailed {
                input: event_type.to_string(),
                reason: "event type contains an empty segment after cleaning".to_string(),
            });
        }

        Ok(cleaned.join("."))
    }
}
