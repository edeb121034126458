//! API layer - thin request handlers over the core operations
//!
//! Handlers take JSON-shaped DTOs, call into [`crate::core`] and return
//! serialisable views. They are framework-agnostic: an HTTP server (or any
//! other transport) maps [`ErrorBody`] and [`status_code`] onto its own
//! response type.

/// Webhook intake, checkout and cancellation
pub mod billing;
/// Balance and transaction queries
pub mod credits;
/// Charged content generation
pub mod generate;
/// Scheduled-task requests
pub mod tasks;

use crate::config::AppConfig;
use crate::errors::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::error;

/// Shared state available to every handler.
pub struct ApiContext {
    /// Database connection for all store operations
    pub database: DatabaseConnection,
    /// Loaded application settings
    pub config: AppConfig,
}

impl ApiContext {
    /// Bundles the store connection with loaded settings.
    #[must_use]
    pub const fn new(database: DatabaseConnection, config: AppConfig) -> Self {
        Self { database, config }
    }
}

/// Structured error returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable kind, see [`Error::kind`]
    pub kind: &'static str,
    /// Safe to show; store details are never included
    pub message: String,
    /// Whether repeating the request later may succeed
    pub retryable: bool,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let message = match err {
            // Store and configuration details stay in the logs
            Error::Database(_) | Error::Config { .. } => {
                error!(error = %err, "Internal error while handling request");
                "Internal error, please try again later".to_string()
            }
            Error::StoreConflict { .. } => "The request conflicted with another update, please retry".to_string(),
            _ => err.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
            retryable: err.is_retryable(),
        }
    }
}

/// HTTP status a transport should use for `err`.
#[must_use]
pub const fn status_code(err: &Error) -> u16 {
    match err {
        Error::InvalidAmount { .. }
        | Error::InvalidRequest { .. }
        | Error::UnknownValue { .. }
        | Error::InvalidScheduleTime { .. } => 400,
        Error::InsufficientCredits { .. } => 402,
        Error::TaskNotFound { .. } => 404,
        Error::TaskNotEditable { .. } => 409,
        Error::QuotaExceeded { .. } => 429,
        Error::DuplicateEvent { .. } => 200,
        Error::UnresolvableEvent { .. } => 422,
        Error::ProviderUnavailable { .. } => 502,
        Error::StoreConflict { .. } => 503,
        Error::Config { .. } | Error::Database(_) => 500,
    }
}

/// Parses an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::InvalidRequest {
            message: format!("{field} must be an ISO-8601 timestamp, got '{value}'"),
        })
}

/// Caller-supplied page size, bounded to `1..=max`.
fn page_limit(limit: Option<u64>, max: u64) -> Option<u64> {
    limit.map(|limit| limit.clamp(1, max.max(1)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use sea_orm::DbErr;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = DateTime::parse_from_rfc3339("2030-05-11T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_timestamp("scheduled_for", "2030-05-11T10:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("scheduled_for", "2030-05-11T12:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("scheduled_for", "2030-05-11T10:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("scheduled_for", "2030-05-11T10:00").unwrap(), expected);

        let err = parse_timestamp("scheduled_for", "tomorrow").unwrap_err();
        assert!(err.to_string().contains("scheduled_for"));
    }

    #[test]
    fn test_error_body_hides_store_details() {
        let err: Error = DbErr::Custom("no such table: credit_accounts".into()).into();
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, "internal");
        assert!(!body.message.contains("credit_accounts"));
        assert_eq!(status_code(&err), 500);
    }

    #[test]
    fn test_error_body_keeps_actionable_detail() {
        let err = Error::QuotaExceeded { used: 30, limit: 30 };
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, "quota_exceeded");
        assert!(body.message.contains("30 of 30"));
        assert!(!body.retryable);
        assert_eq!(status_code(&err), 429);

        let json = serde_json::to_value(ErrorBody::from(&Error::InsufficientCredits {
            balance: 0,
            required: 1,
        }))
        .unwrap();
        assert_eq!(json["kind"], "insufficient_credits");
        assert!(json["message"].as_str().unwrap().contains("Upgrade"));
    }

    #[test]
    fn test_page_limit_bounds() {
        assert_eq!(page_limit(None, 100), None);
        assert_eq!(page_limit(Some(0), 100), Some(1));
        assert_eq!(page_limit(Some(500), 100), Some(100));
    }
}
