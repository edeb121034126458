//! `Postmeter` - metered content generation and scheduled publishing
//!
//! This crate provides the consistency core of a content-scheduling service: a
//! per-owner credit ledger, a subscription state machine driven by billing
//! webhooks, and a scheduled-task queue with a monthly quota and an
//! at-most-one-worker claim protocol for dispatchers.

// Deny the most critical lints that could lead to bugs or security issues
#![deny(
    // Security and correctness
    unsafe_code,
    unsafe_op_in_unsafe_fn,

    // Code quality - things that are almost always bugs
    unreachable_code,
    unreachable_patterns,
    unused_must_use,

    // Documentation - broken links are bugs
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
)]
// Warn on things that should be fixed but aren't necessarily bugs
#![warn(
    // Documentation - missing docs should be added gradually
    missing_docs,

    // Clippy categories for overall code quality
    clippy::all,
    clippy::pedantic,
    clippy::nursery,

    // Performance
    clippy::inefficient_to_string,
    clippy::large_types_passed_by_value,
    clippy::needless_pass_by_value,
    clippy::unnecessary_wraps,

    // Correctness
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::exit,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,

    // Complexity and readability
    clippy::cognitive_complexity,
    clippy::large_enum_variant,
    clippy::match_same_arms,
    clippy::too_many_lines,

    // Style consistency
    clippy::enum_glob_use,
    clippy::inconsistent_struct_constructor,
    clippy::redundant_closure_for_method_calls,
    clippy::semicolon_if_nothing_returned,
    clippy::wildcard_imports,

    // Future compatibility
    future_incompatible,
    rust_2018_idioms,
)]
// Allow some pedantic lints that are too noisy or not applicable
#![allow(
    clippy::module_name_repetitions,  // Common pattern in Rust
    clippy::missing_errors_doc,        // Every operation returns the crate `Result`
    clippy::missing_panics_doc,
    clippy::too_many_arguments,        // Core operations take db, config, owner and `now` explicitly
)]

/// Request handlers - DTOs, timestamp parsing and structured error bodies
pub mod api;
/// Configuration management for database, settings and secrets
pub mod config;
/// Core business logic - ledger, subscriptions and the scheduled-task queue
pub mod core;
/// Dispatcher polling loop
pub mod dispatcher;
/// SeaORM entity definitions for database tables
pub mod entities;
/// Unified error types and result handling
pub mod errors;
/// Typed domain values and views
pub mod models;
/// External collaborators - billing, publishing and content generation
pub mod providers;

#[cfg(test)]
pub mod test_utils;
