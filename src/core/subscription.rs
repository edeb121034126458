//! Subscription state machine - Tier and status transitions driven by billing events.
//!
//! Each event is applied in one store transaction together with its
//! `processed_events` row and any ledger change, so a redelivered event is a
//! no-op. Owner-initiated actions (checkout, cancellation) call the billing
//! provider before opening a transaction.

use crate::{
    config::AppConfig,
    core::{
        events::{BillingEvent, BillingEventKind, RawBillingEvent, record_event_in},
        ledger::{self, Grant},
        store::retry_on_conflict,
    },
    entities::{CheckoutSession, SubscriptionState, checkout_session, subscription_state},
    errors::{Error, Result},
    models::{Subscription, SubscriptionStatus, Tier, TransactionKind},
    providers::{BillingProvider, CheckoutLink},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    DatabaseTransaction, Set, TransactionTrait,
    prelude::*,
    sea_query::{Expr, OnConflict},
};
use tracing::{debug, info, instrument, warn};

/// Result of handing an event to [`apply_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The transition ran; carries the new state
    Applied(Subscription),
    /// The event id was already processed
    Duplicate,
    /// The event kind is not one this system acts on
    Ignored,
}

/// Validates and applies a normalised event.
pub async fn apply_raw_event(
    db: &DatabaseConnection,
    config: &AppConfig,
    raw: RawBillingEvent,
    now: DateTime<Utc>,
) -> Result<EventOutcome> {
    let kind = raw.event_kind.clone();
    match BillingEvent::from_raw(raw)? {
        Some(event) => apply_event(db, config, &event, now).await,
        None => {
            debug!(event_kind = %kind, "Ignoring billing event");
            Ok(EventOutcome::Ignored)
        }
    }
}

/// Applies a billing event exactly once.
///
/// The `processed_events` insert comes first in the transaction; if the id is
/// already present the transaction is abandoned and [`EventOutcome::Duplicate`]
/// is returned. Unresolvable events are not recorded, so a later redelivery
/// can still succeed.
#[instrument(skip(db, config, event), fields(event_id = %event.event_id, kind = event.kind.name()))]
pub async fn apply_event(
    db: &DatabaseConnection,
    config: &AppConfig,
    event: &BillingEvent,
    now: DateTime<Utc>,
) -> Result<EventOutcome> {
    let result = retry_on_conflict(
        config.store.conflict_retries,
        "apply_event",
        move || async move {
            let txn = db.begin().await?;
            match apply_in(&txn, config, event, now).await {
                Ok(state) => {
                    txn.commit().await?;
                    Ok(state)
                }
                Err(err) => {
                    txn.rollback().await?;
                    Err(err)
                }
            }
        },
    )
    .await;

    match result {
        Ok(state) => {
            info!(
                owner_id = %state.owner_id,
                tier = %state.tier,
                status = %state.status,
                "Billing event applied"
            );
            Ok(EventOutcome::Applied(state))
        }
        Err(Error::DuplicateEvent { .. }) => {
            debug!("Billing event already processed");
            Ok(EventOutcome::Duplicate)
        }
        Err(err @ Error::UnresolvableEvent { .. }) => {
            warn!(error = %err, "Billing event needs operator attention");
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn apply_in(
    txn: &DatabaseTransaction,
    config: &AppConfig,
    event: &BillingEvent,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    record_event_in(txn, &event.event_id, event.kind.name(), now).await?;
    let ledger_key = format!("billing-event:{}", event.event_id);

    let model = match &event.kind {
        BillingEventKind::CheckoutCompleted {
            owner_id,
            subscription_id,
            price_id,
            period_end,
            customer_id,
            session_id,
        } => {
            let tier = config.tiers.tier_for_price(price_id).ok_or_else(|| {
                unresolvable(event, format!("price {price_id} does not match a paid tier"))
            })?;
            let state = get_or_create_state_in(txn, owner_id, now).await?;

            let mut active: subscription_state::ActiveModel = state.into();
            active.tier = Set(tier.as_str().to_string());
            active.status = Set(SubscriptionStatus::Active.as_str().to_string());
            active.provider_subscription_id = Set(Some(subscription_id.clone()));
            active.period_end = Set(*period_end);
            if let Some(customer_id) = customer_id {
                active.provider_customer_id = Set(Some(customer_id.clone()));
            }
            active.updated_at = Set(now);
            let model = active.update(txn).await?;

            let allotment = config.tiers.allotment(tier);
            if allotment > 0 {
                ledger::grant_in(
                    txn,
                    config,
                    &Grant {
                        owner_id,
                        amount: allotment,
                        kind: TransactionKind::SubscriptionGrant,
                        reason: &format!("{tier} subscription activated"),
                        idempotency_key: Some(ledger_key.as_str()),
                    },
                    now,
                )
                .await?;
            }

            if let Some(session_id) = session_id {
                CheckoutSession::update_many()
                    .col_expr(checkout_session::Column::Status, Expr::value("completed"))
                    .col_expr(checkout_session::Column::CompletedAt, Expr::value(now))
                    .filter(checkout_session::Column::ProviderSessionId.eq(session_id.as_str()))
                    .exec(txn)
                    .await?;
            }
            model
        }
        BillingEventKind::InvoicePaid {
            subscription_id,
            period_end,
        } => {
            let state = find_by_subscription_in(txn, event, subscription_id).await?;
            if is_cancelled(&state) {
                debug!(owner_id = %state.owner_id, "Invoice for cancelled subscription");
                state
            } else {
                let mut active: subscription_state::ActiveModel = state.into();
                active.status = Set(SubscriptionStatus::Active.as_str().to_string());
                if period_end.is_some() {
                    active.period_end = Set(*period_end);
                }
                active.updated_at = Set(now);
                active.update(txn).await?
            }
        }
        BillingEventKind::InvoiceFailed { subscription_id } => {
            let state = find_by_subscription_in(txn, event, subscription_id).await?;
            if is_cancelled(&state) {
                state
            } else {
                let mut active: subscription_state::ActiveModel = state.into();
                active.status = Set(SubscriptionStatus::PastDue.as_str().to_string());
                active.updated_at = Set(now);
                active.update(txn).await?
            }
        }
        BillingEventKind::SubscriptionDeleted { subscription_id } => {
            let state = find_by_subscription_in(txn, event, subscription_id).await?;
            let owner_id = state.owner_id.clone();

            let mut active: subscription_state::ActiveModel = state.into();
            active.tier = Set(Tier::Free.as_str().to_string());
            active.status = Set(SubscriptionStatus::Inactive.as_str().to_string());
            active.provider_subscription_id = Set(None);
            active.period_end = Set(None);
            active.updated_at = Set(now);
            let model = active.update(txn).await?;

            ledger::set_balance_in(
                txn,
                config,
                &owner_id,
                config.tiers.allotment(Tier::Free),
                "Subscription ended, balance reset to free tier",
                &ledger_key,
                now,
            )
            .await?;
            model
        }
    };

    Subscription::try_from(model)
}

fn is_cancelled(state: &subscription_state::Model) -> bool {
    state.status == SubscriptionStatus::Cancelled.as_str()
}

fn unresolvable(event: &BillingEvent, reason: String) -> Error {
    Error::UnresolvableEvent {
        event_id: event.event_id.clone(),
        reason,
    }
}

async fn find_by_subscription_in(
    txn: &DatabaseTransaction,
    event: &BillingEvent,
    subscription_id: &str,
) -> Result<subscription_state::Model> {
    SubscriptionState::find()
        .filter(subscription_state::Column::ProviderSubscriptionId.eq(subscription_id))
        .one(txn)
        .await?
        .ok_or_else(|| unresolvable(event, format!("subscription {subscription_id} has no owner")))
}

/// Returns the owner's stored state, inserting `free`/`inactive` if absent.
pub(crate) async fn get_or_create_state_in<C>(
    conn: &C,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<subscription_state::Model>
where
    C: ConnectionTrait,
{
    let fresh = subscription_state::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        tier: Set(Tier::Free.as_str().to_string()),
        status: Set(SubscriptionStatus::Inactive.as_str().to_string()),
        provider_customer_id: Set(None),
        provider_subscription_id: Set(None),
        period_end: Set(None),
        updated_at: Set(now),
    };
    SubscriptionState::insert(fresh)
        .on_conflict(
            OnConflict::column(subscription_state::Column::OwnerId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    SubscriptionState::find_by_id(owner_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            Error::Database(DbErr::RecordNotFound(format!("subscription state {owner_id}")))
        })
}

/// Returns the owner's subscription; owners never seen are `free`/`inactive`.
pub async fn get_subscription(db: &DatabaseConnection, owner_id: &str) -> Result<Subscription> {
    match SubscriptionState::find_by_id(owner_id).one(db).await? {
        Some(model) => Subscription::try_from(model),
        None => Ok(Subscription {
            owner_id: owner_id.to_string(),
            tier: Tier::Free,
            status: SubscriptionStatus::Inactive,
            provider_customer_id: None,
            provider_subscription_id: None,
            period_end: None,
        }),
    }
}

/// Starts a provider checkout for a paid tier.
///
/// Creates the provider customer on first use and records the session as
/// `pending` until its `checkout_completed` event arrives.
#[instrument(skip(db, config, provider, email))]
pub async fn start_checkout(
    db: &DatabaseConnection,
    config: &AppConfig,
    provider: &dyn BillingProvider,
    owner_id: &str,
    email: &str,
    tier: Tier,
    now: DateTime<Utc>,
) -> Result<CheckoutLink> {
    let price_id = config
        .tiers
        .plan(tier)
        .price_id
        .clone()
        .filter(|_| tier.is_paid())
        .ok_or_else(|| Error::InvalidRequest {
            message: format!("tier {tier} cannot be purchased"),
        })?;

    let state = get_or_create_state_in(db, owner_id, now).await?;
    if state.status == SubscriptionStatus::Active.as_str() && state.tier == tier.as_str() {
        return Err(Error::InvalidRequest {
            message: format!("already subscribed to {tier}"),
        });
    }

    let customer_id = match state.provider_customer_id {
        Some(customer_id) => customer_id,
        None => {
            let customer_id = provider.create_customer(email, owner_id).await?;
            SubscriptionState::update_many()
                .col_expr(
                    subscription_state::Column::ProviderCustomerId,
                    Expr::value(customer_id.clone()),
                )
                .col_expr(subscription_state::Column::UpdatedAt, Expr::value(now))
                .filter(subscription_state::Column::OwnerId.eq(owner_id))
                .exec(db)
                .await?;
            customer_id
        }
    };

    let link = provider
        .create_checkout_session(&customer_id, &price_id, owner_id)
        .await?;

    checkout_session::ActiveModel {
        provider_session_id: Set(link.session_id.clone()),
        owner_id: Set(owner_id.to_string()),
        tier: Set(tier.as_str().to_string()),
        status: Set("pending".to_string()),
        url: Set(link.url.clone()),
        created_at: Set(now),
        completed_at: Set(None),
    }
    .insert(db)
    .await?;

    info!(owner_id, tier = %tier, session_id = %link.session_id, "Checkout started");
    Ok(link)
}

/// Owner-initiated cancellation.
///
/// Cancels at the provider first, then marks the state `cancelled`/`free`. The
/// subscription id is kept so the provider's later `subscription_deleted`
/// event still resolves to this owner.
#[instrument(skip(db, provider))]
pub async fn cancel_subscription(
    db: &DatabaseConnection,
    provider: &dyn BillingProvider,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    let current = get_subscription(db, owner_id).await?;
    if current.status == SubscriptionStatus::Cancelled {
        return Ok(current);
    }
    let subscription_id = current
        .provider_subscription_id
        .ok_or_else(|| Error::InvalidRequest {
            message: "no subscription to cancel".to_string(),
        })?;

    provider.cancel_subscription(&subscription_id).await?;

    SubscriptionState::update_many()
        .col_expr(
            subscription_state::Column::Status,
            Expr::value(SubscriptionStatus::Cancelled.as_str()),
        )
        .col_expr(subscription_state::Column::Tier, Expr::value(Tier::Free.as_str()))
        .col_expr(subscription_state::Column::UpdatedAt, Expr::value(now))
        .filter(subscription_state::Column::OwnerId.eq(owner_id))
        .filter(subscription_state::Column::ProviderSubscriptionId.eq(subscription_id.as_str()))
        .exec(db)
        .await?;

    info!(owner_id, "Subscription cancelled");
    get_subscription(db, owner_id).await
}
