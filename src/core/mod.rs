//! Core business logic - framework-agnostic ledger, subscription and queue operations.

/// Billing event intake and idempotency records
pub mod events;
/// Caller-side generation gate
pub mod generation;
/// Credit balances and the append-only transaction log
pub mod ledger;
/// Scheduled-task admission, lifecycle and dispatcher claims
pub mod schedule;
/// Retry glue for transient store conflicts
pub mod store;
/// Subscription state machine
pub mod subscription;
