//! Billing events and their idempotency record.
//!
//! Provider payloads are first normalised into [`RawBillingEvent`], then into
//! the closed [`BillingEvent`] type that the subscription state machine matches
//! on. Each applied event leaves exactly one `processed_events` row, written in
//! the same transaction as its side effects.

use crate::entities::{ProcessedEvent, processed_event};
use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, Set, sea_query::OnConflict};
use serde::{Deserialize, Serialize};

/// Normalised billing event as received from the webhook layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBillingEvent {
    /// Provider event id
    pub event_id: String,
    /// One of the normalised kinds, e.g. `checkout_completed`
    pub event_kind: String,
    /// Owner, when the provider payload carried it
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Provider subscription id
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Price the subscription is on
    #[serde(default)]
    pub price_id: Option<String>,
    /// End of the paid period, unix seconds
    #[serde(default)]
    pub period_end_epoch: Option<i64>,
    /// Provider customer id
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Checkout session that produced the event
    #[serde(default)]
    pub session_id: Option<String>,
}

/// The four event kinds that drive subscription transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventKind {
    /// A checkout finished and a subscription exists
    CheckoutCompleted {
        /// Owner who checked out
        owner_id: String,
        /// New provider subscription
        subscription_id: String,
        /// Price that selects the tier
        price_id: String,
        /// End of the first paid period
        period_end: Option<DateTime<Utc>>,
        /// Provider customer
        customer_id: Option<String>,
        /// Session that completed
        session_id: Option<String>,
    },
    /// A renewal was paid
    InvoicePaid {
        /// Renewed subscription
        subscription_id: String,
        /// End of the new period
        period_end: Option<DateTime<Utc>>,
    },
    /// A renewal payment failed
    InvoiceFailed {
        /// Subscription now past due
        subscription_id: String,
    },
    /// The provider ended the subscription
    SubscriptionDeleted {
        /// Subscription that ended
        subscription_id: String,
    },
}

impl BillingEventKind {
    /// Normalised kind name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::InvoiceFailed { .. } => "invoice_failed",
            Self::SubscriptionDeleted { .. } => "subscription_deleted",
        }
    }
}

/// A billing event ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingEvent {
    /// Provider event id; the idempotency key
    pub event_id: String,
    /// What happened, with the fields that transition needs
    pub kind: BillingEventKind,
}

impl BillingEvent {
    /// Validates a raw event.
    ///
    /// Returns `Ok(None)` for kinds this system does not act on. Missing
    /// references are [`Error::UnresolvableEvent`] so the sender retries.
    pub fn from_raw(raw: RawBillingEvent) -> Result<Option<Self>> {
        let event_id = raw.event_id.trim().to_string();
        if event_id.is_empty() {
            return Err(Error::InvalidRequest {
                message: "billing event has no event_id".to_string(),
            });
        }

        let missing = |field: &str| Error::UnresolvableEvent {
            event_id: event_id.clone(),
            reason: format!("{} event is missing {field}", raw.event_kind),
        };
        let period_end = match raw.period_end_epoch {
            Some(epoch) => Some(DateTime::from_timestamp(epoch, 0).ok_or_else(|| {
                Error::InvalidRequest {
                    message: format!("period_end_epoch {epoch} is out of range"),
                }
            })?),
            None => None,
        };

        let kind = match raw.event_kind.as_str() {
            "checkout_completed" => BillingEventKind::CheckoutCompleted {
                owner_id: raw.owner_id.ok_or_else(|| missing("owner_id"))?,
                subscription_id: raw.subscription_id.ok_or_else(|| missing("subscription_id"))?,
                price_id: raw.price_id.ok_or_else(|| missing("price_id"))?,
                period_end,
                customer_id: raw.customer_id,
                session_id: raw.session_id,
            },
            "invoice_paid" => BillingEventKind::InvoicePaid {
                subscription_id: raw.subscription_id.ok_or_else(|| missing("subscription_id"))?,
                period_end,
            },
            "invoice_failed" => BillingEventKind::InvoiceFailed {
                subscription_id: raw.subscription_id.ok_or_else(|| missing("subscription_id"))?,
            },
            "subscription_deleted" => BillingEventKind::SubscriptionDeleted {
                subscription_id: raw.subscription_id.ok_or_else(|| missing("subscription_id"))?,
            },
            _ => return Ok(None),
        };

        Ok(Some(Self { event_id, kind }))
    }
}

/// Records an event as processed inside the caller's transaction.
///
/// Fails with [`Error::DuplicateEvent`] when the id is already recorded; the
/// caller must then abandon its transaction.
pub(crate) async fn record_event_in<C>(
    conn: &C,
    event_id: &str,
    event_kind: &str,
    now: DateTime<Utc>,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let record = processed_event::ActiveModel {
        provider_event_id: Set(event_id.to_string()),
        event_kind: Set(event_kind.to_string()),
        processed_at: Set(now),
    };
    let inserted = ProcessedEvent::insert(record)
        .on_conflict(
            OnConflict::column(processed_event::Column::ProviderEventId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    if inserted == 0 {
        return Err(Error::DuplicateEvent {
            event_id: event_id.to_string(),
        });
    }
    Ok(())
}

/// Whether an event id has been applied.
pub async fn is_processed(db: &DatabaseConnection, event_id: &str) -> Result<bool> {
    Ok(ProcessedEvent::find_by_id(event_id).one(db).await?.is_some())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use sea_orm::TransactionTrait;

    fn raw(kind: &str) -> RawBillingEvent {
        RawBillingEvent {
            event_id: "evt_1".to_string(),
            event_kind: kind.to_string(),
            owner_id: Some("alice".to_string()),
            subscription_id: Some("sub_1".to_string()),
            price_id: Some("price_pro".to_string()),
            period_end_epoch: Some(1_900_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_known_kinds_are_parsed() {
        let event = BillingEvent::from_raw(raw("checkout_completed")).unwrap().unwrap();
        assert_eq!(event.kind.name(), "checkout_completed");
        let BillingEventKind::CheckoutCompleted { period_end, .. } = event.kind else {
            panic!("wrong kind");
        };
        assert_eq!(period_end, DateTime::from_timestamp(1_900_000_000, 0));

        let event = BillingEvent::from_raw(raw("invoice_failed")).unwrap().unwrap();
        assert_eq!(
            event.kind,
            BillingEventKind::InvoiceFailed {
                subscription_id: "sub_1".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        assert_eq!(BillingEvent::from_raw(raw("customer.created")).unwrap(), None);
    }

    #[test]
    fn test_missing_reference_is_unresolvable() {
        let mut event = raw("subscription_deleted");
        event.subscription_id = None;
        let result = BillingEvent::from_raw(event);
        assert!(matches!(result, Err(Error::UnresolvableEvent { ref reason, .. }) if reason.contains("subscription_id")));

        let mut event = raw("checkout_completed");
        event.owner_id = None;
        assert!(matches!(
            BillingEvent::from_raw(event),
            Err(Error::UnresolvableEvent { .. })
        ));
    }

    #[test]
    fn test_blank_event_id_is_rejected() {
        let mut event = raw("invoice_paid");
        event.event_id = "  ".to_string();
        assert!(matches!(
            BillingEvent::from_raw(event),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_record_is_duplicate() -> Result<()> {
        let db = setup_test_db().await?;

        let txn = db.begin().await?;
        record_event_in(&txn, "evt_9", "invoice_paid", fixed_now()).await?;
        txn.commit().await?;
        assert!(is_processed(&db, "evt_9").await?);

        let txn = db.begin().await?;
        let result = record_event_in(&txn, "evt_9", "invoice_paid", fixed_now()).await;
        txn.rollback().await?;
        assert!(matches!(result, Err(Error::DuplicateEvent { event_id }) if event_id == "evt_9"));
        Ok(())
    }
}
