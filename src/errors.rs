//! Unified error type for the ledger, subscription and scheduling operations.
//!
//! Every fallible operation in the crate returns [`Result`]. Store errors are
//! classified on conversion: lock or serialization contention becomes
//! [`Error::StoreConflict`] (retried by [`crate::core::store::retry_on_conflict`]),
//! everything else stays a [`Error::Database`] error.

use crate::models::TaskStatus;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use thiserror::Error;

/// All errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The owner's balance does not cover the requested deduction.
    #[error("Insufficient credits: balance is {balance}, {required} required. Upgrade your plan or wait for the next reset")]
    InsufficientCredits {
        /// Balance at the time of the attempt
        balance: i64,
        /// Amount that was requested
        required: i64,
    },

    /// The owner already has the maximum number of counted tasks this month.
    #[error("Monthly limit reached: {used} of {limit} scheduled tasks used this month")]
    QuotaExceeded {
        /// Counted tasks in the current month
        used: u64,
        /// Configured monthly cap
        limit: u64,
    },

    /// A schedule time was not strictly in the future.
    #[error("Scheduled time {scheduled_for} must be in the future")]
    InvalidScheduleTime {
        /// The rejected time
        scheduled_for: DateTime<Utc>,
    },

    /// The task is no longer in a state that allows the requested change.
    #[error("Task is {status} and can no longer be changed")]
    TaskNotEditable {
        /// Current status of the task
        status: TaskStatus,
    },

    /// No task with this id is visible to the caller.
    #[error("Scheduled task not found")]
    TaskNotFound {
        /// Requested task id
        task_id: i64,
    },

    /// The billing event was already applied. Callers treat this as success.
    #[error("Billing event {event_id} was already processed")]
    DuplicateEvent {
        /// Provider event id
        event_id: String,
    },

    /// A billing event references an owner or subscription we cannot resolve.
    #[error("Billing event {event_id} could not be resolved: {reason}")]
    UnresolvableEvent {
        /// Provider event id
        event_id: String,
        /// What was missing or unknown
        reason: String,
    },

    /// Transient store contention; retry the whole operation.
    #[error("Store conflict: {message}")]
    StoreConflict {
        /// Store-reported detail
        message: String,
    },

    /// An external provider (billing, publishing, generation) failed.
    #[error("Provider unavailable: {message}")]
    ProviderUnavailable {
        /// Provider-reported detail
        message: String,
    },

    /// A credit amount was zero, negative or otherwise unusable.
    #[error("Invalid amount: {amount}")]
    InvalidAmount {
        /// The rejected amount
        amount: i64,
    },

    /// Malformed client input.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Human-readable description
        message: String,
    },

    /// A stored or supplied string did not name a known enum value.
    #[error("Unknown {field} value '{value}'")]
    UnknownValue {
        /// Field being parsed
        field: &'static str,
        /// The unrecognised value
        value: String,
    },

    /// Settings could not be loaded or are incomplete.
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
    },

    /// Non-transient store error.
    #[error("Database error: {0}")]
    Database(DbErr),
}

impl Error {
    /// Stable machine-readable kind used in `{kind, message}` error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InvalidScheduleTime { .. } => "invalid_schedule_time",
            Self::TaskNotEditable { .. } => "task_not_editable",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::DuplicateEvent { .. } => "duplicate_event",
            Self::UnresolvableEvent { .. } => "unresolvable_event",
            Self::StoreConflict { .. } => "store_conflict",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::InvalidAmount { .. } | Self::InvalidRequest { .. } | Self::UnknownValue { .. } => {
                "invalid_request"
            }
            Self::Config { .. } | Self::Database(_) => "internal",
        }
    }

    /// Whether the caller (or the webhook sender) should retry later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreConflict { .. }
                | Self::ProviderUnavailable { .. }
                | Self::UnresolvableEvent { .. }
                | Self::Database(_)
        )
    }
}

impl From<DbErr> for Error {
    fn from(err: DbErr) -> Self {
        if is_contention(&err) {
            Self::StoreConflict {
                message: err.to_string(),
            }
        } else {
            Self::Database(err)
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::ProviderUnavailable {
            message: err.to_string(),
        }
    }
}

fn is_contention(err: &DbErr) -> bool {
    const MARKERS: [&str; 5] = [
        "database is locked",
        "database table is locked",
        "could not serialize access",
        "deadlock detected",
        "lock timeout",
    ];
    let text = err.to_string().to_lowercase();
    MARKERS.iter().any(|marker| text.contains(marker))
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
