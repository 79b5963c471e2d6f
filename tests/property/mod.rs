// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module
//!
//! Consumer names must be recomputable after a restart and cleaned segments
//! must be valid NATS subject tokens, whatever the user typed.

mod cleaner;
mod identifier;
