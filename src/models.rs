//! Typed domain values.
//!
//! The store keeps enum columns as plain strings; these types are what the
//! rest of the crate works with. Conversions from entity models live here too.

use crate::entities::{scheduled_task, subscription_state};
use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored string form of this value.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::UnknownValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Subscription level determining the monthly credit allotment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Default tier for every owner
    Free,
    /// Paid tier
    Pro,
    /// Paid tier with the largest allotment
    Enterprise,
}

string_enum!(Tier, "tier", {
    Free => "free",
    Pro => "pro",
    Enterprise => "enterprise",
});

impl Tier {
    /// Whether this tier is bought through a checkout.
    #[must_use]
    pub const fn is_paid(self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Billing status of an owner's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// No paid subscription
    Inactive,
    /// Paid and current
    Active,
    /// Renewal payment failed
    PastDue,
    /// Cancelled by the owner; a new checkout starts a fresh cycle
    Cancelled,
}

string_enum!(SubscriptionStatus, "subscription status", {
    Inactive => "inactive",
    Active => "active",
    PastDue => "past_due",
    Cancelled => "cancelled",
});

/// Reason a ledger row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits spent on a generation request
    GenerationSpend,
    /// Credits granted by a subscription (or the opening free balance)
    SubscriptionGrant,
    /// Operator or state-machine correction
    ManualAdjustment,
    /// Zero-amount marker written when the monthly usage counter resets
    PeriodReset,
}

string_enum!(TransactionKind, "transaction kind", {
    GenerationSpend => "generation_spend",
    SubscriptionGrant => "subscription_grant",
    ManualAdjustment => "manual_adjustment",
    PeriodReset => "period_reset",
});

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its time; editable
    Pending,
    /// Claimed by a dispatcher worker
    Processing,
    /// Terminal: published
    Published,
    /// Terminal: out of attempts
    Failed,
    /// Terminal: cancelled by the owner
    Cancelled,
}

string_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Processing => "processing",
    Published => "published",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    /// Statuses that count against the monthly quota.
    pub const COUNTED: [Self; 2] = [Self::Pending, Self::Published];

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Cancelled)
    }
}

/// A future-dated publish task as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    /// Store-assigned id
    pub id: i64,
    /// Owner the task belongs to
    pub owner_id: String,
    /// Platform name
    pub target: String,
    /// Post body
    pub content: String,
    /// Hashtags without the leading `#`
    pub tags: Vec<String>,
    /// Optional attachment reference
    pub media_ref: Option<String>,
    /// When the task becomes due
    pub scheduled_for: DateTime<Utc>,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Claims so far, including the current one
    pub attempt_count: i32,
    /// Message from the most recent failed attempt
    pub last_error: Option<String>,
    /// When the task was scheduled
    pub created_at: DateTime<Utc>,
    /// When the task last changed
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<scheduled_task::Model> for ScheduledTask {
    type Error = Error;

    fn try_from(model: scheduled_task::Model) -> Result<Self> {
        let tags = serde_json::from_value(model.tags).map_err(|e| Error::InvalidRequest {
            message: format!("stored tags are not a list of strings: {e}"),
        })?;
        Ok(Self {
            id: model.id,
            status: model.status.parse()?,
            owner_id: model.owner_id,
            target: model.target,
            content: model.content,
            tags,
            media_ref: model.media_ref,
            scheduled_for: model.scheduled_for,
            attempt_count: model.attempt_count,
            last_error: model.last_error,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// An owner's subscription state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    /// Owner the subscription belongs to
    pub owner_id: String,
    /// Plan currently granted
    pub tier: Tier,
    /// Billing status
    pub status: SubscriptionStatus,
    /// Billing provider customer, once checkout has started
    pub provider_customer_id: Option<String>,
    /// Billing provider subscription, once checkout has completed
    pub provider_subscription_id: Option<String>,
    /// End of the paid period
    pub period_end: Option<DateTime<Utc>>,
}

impl TryFrom<subscription_state::Model> for Subscription {
    type Error = Error;

    fn try_from(model: subscription_state::Model) -> Result<Self> {
        Ok(Self {
            tier: model.tier.parse()?,
            status: model.status.parse()?,
            owner_id: model.owner_id,
            provider_customer_id: model.provider_customer_id,
            provider_subscription_id: model.provider_subscription_id,
            period_end: model.period_end,
        })
    }
}

/// Ledger query result for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    /// Current balance, serialised as `credits`
    #[serde(rename = "credits")]
    pub balance: i64,
    /// Plan currently granted
    pub tier: Tier,
    /// Billing status
    pub status: SubscriptionStatus,
    /// Credits spent this period
    pub monthly_used: i64,
    /// When `monthly_used` next resets
    pub reset_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_enum_strings_round_trip_through_store_form() {
        assert_eq!("past_due".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::PastDue);
        assert_eq!(TransactionKind::PeriodReset.as_str(), "period_reset");
        assert_eq!(Tier::Enterprise.to_string(), "enterprise");
        assert!(matches!(
            "archived".parse::<TaskStatus>(),
            Err(Error::UnknownValue { field: "task status", .. })
        ));
    }

    #[test]
    fn test_terminal_task_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Published.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_account_summary_serializes_with_public_field_names() {
        let summary = AccountSummary {
            balance: 12,
            tier: Tier::Pro,
            status: SubscriptionStatus::Active,
            monthly_used: 3,
            reset_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["credits"], 12);
        assert_eq!(json["tier"], "pro");
        assert_eq!(json["monthlyUsed"], 3);
    }
}
