//! Billing requests: provider webhooks, checkout and cancellation.
//!
//! Stripe payloads are verified, then translated into the normalised
//! [`RawBillingEvent`] the subscription state machine consumes. Provider
//! lookups made during translation surface as
//! [`crate::errors::Error::ProviderUnavailable`], so the webhook is retried.
//!
//! Handlers take the provider as `&dyn BillingProvider`. The HTTP transport
//! that mounts them builds it once at startup with
//! [`crate::providers::stripe::StripeClient::from_secrets`] over
//! [`crate::config::secrets::BillingSecrets::from_env`], and passes the
//! webhook secret from the same value to [`stripe_webhook`].

use crate::{
    api::ApiContext,
    core::{
        events::RawBillingEvent,
        subscription::{self, EventOutcome},
    },
    errors::{Error, Result},
    models::{Subscription, Tier},
    providers::{
        BillingProvider, CheckoutLink,
        stripe::{self, StripeEvent},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Acknowledgement returned to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    /// Always `true` once the payload was verified
    pub received: bool,
    /// `applied`, `duplicate` or `ignored`
    pub outcome: &'static str,
}

impl From<&EventOutcome> for WebhookAck {
    fn from(outcome: &EventOutcome) -> Self {
        let outcome = match outcome {
            EventOutcome::Applied(_) => "applied",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Ignored => "ignored",
        };
        Self {
            received: true,
            outcome,
        }
    }
}

/// Body of a checkout request.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutBody {
    /// Email the provider customer is created with
    pub email: String,
    /// Paid tier to subscribe to
    pub tier: Tier,
}

/// Verifies and applies a Stripe webhook delivery.
pub async fn stripe_webhook(
    ctx: &ApiContext,
    provider: &dyn BillingProvider,
    webhook_secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: DateTime<Utc>,
) -> Result<WebhookAck> {
    let event = stripe::verify_webhook(webhook_secret, payload, signature_header, now)?;
    debug!(event_id = %event.id, event_type = %event.type_, "Verified webhook");

    let outcome = match translate_stripe_event(provider, &event).await? {
        Some(raw) => subscription::apply_raw_event(&ctx.database, &ctx.config, raw, now).await?,
        None => {
            debug!(event_id = %event.id, event_type = %event.type_, "Ignoring webhook");
            EventOutcome::Ignored
        }
    };
    Ok(WebhookAck::from(&outcome))
}

/// Applies an already-normalised event delivered as JSON.
///
/// Used by trusted internal senders (for example a queue replaying events an
/// operator resolved by hand).
pub async fn normalized_event(ctx: &ApiContext, payload: &[u8], now: DateTime<Utc>) -> Result<WebhookAck> {
    let raw: RawBillingEvent = serde_json::from_slice(payload).map_err(|e| Error::InvalidRequest {
        message: format!("malformed billing event: {e}"),
    })?;
    let outcome = subscription::apply_raw_event(&ctx.database, &ctx.config, raw, now).await?;
    Ok(WebhookAck::from(&outcome))
}

/// Maps a Stripe event onto one of the four normalised kinds.
///
/// Returns `None` for event types (or payloads) this system does not act on.
pub async fn translate_stripe_event(
    provider: &dyn BillingProvider,
    event: &StripeEvent,
) -> Result<Option<RawBillingEvent>> {
    let object = &event.data.object;
    let base = RawBillingEvent {
        event_id: event.id.clone(),
        ..RawBillingEvent::default()
    };

    let raw = match event.type_.as_str() {
        "checkout.session.completed" => {
            // One-off payments have no subscription and grant nothing
            let Some(subscription_id) = text(object, "/subscription") else {
                return Ok(None);
            };
            let subscription = provider.retrieve_subscription(subscription_id).await?;
            let owner_id = text(object, "/metadata/owner_id")
                .or_else(|| text(object, "/metadata/userId"))
                .or_else(|| text(object, "/client_reference_id"))
                .map(str::to_string)
                .or(subscription.owner_id);
            RawBillingEvent {
                event_kind: "checkout_completed".to_string(),
                owner_id,
                subscription_id: Some(subscription.id),
                price_id: subscription.price_id,
                period_end_epoch: subscription.period_end.map(|end| end.timestamp()),
                customer_id: text(object, "/customer")
                    .map(str::to_string)
                    .or(subscription.customer_id),
                session_id: text(object, "/id").map(str::to_string),
                ..base
            }
        }
        "invoice.payment_succeeded" | "invoice.paid" => {
            let Some(subscription_id) = invoice_subscription(object) else {
                return Ok(None);
            };
            let subscription = provider.retrieve_subscription(subscription_id).await?;
            RawBillingEvent {
                event_kind: "invoice_paid".to_string(),
                subscription_id: Some(subscription.id),
                period_end_epoch: subscription.period_end.map(|end| end.timestamp()),
                ..base
            }
        }
        "invoice.payment_failed" => {
            let Some(subscription_id) = invoice_subscription(object) else {
                return Ok(None);
            };
            RawBillingEvent {
                event_kind: "invoice_failed".to_string(),
                subscription_id: Some(subscription_id.to_string()),
                ..base
            }
        }
        "customer.subscription.deleted" => RawBillingEvent {
            event_kind: "subscription_deleted".to_string(),
            subscription_id: text(object, "/id").map(str::to_string),
            ..base
        },
        _ => return Ok(None),
    };
    Ok(Some(raw))
}

fn text<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Subscription an invoice belongs to; newer API versions nest it under `parent`.
fn invoice_subscription(invoice: &Value) -> Option<&str> {
    text(invoice, "/subscription")
        .or_else(|| text(invoice, "/parent/subscription_details/subscription"))
}

/// Starts a checkout for a paid tier.
pub async fn checkout(
    ctx: &ApiContext,
    provider: &dyn BillingProvider,
    owner_id: &str,
    body: CheckoutBody,
    now: DateTime<Utc>,
) -> Result<CheckoutLink> {
    let email = body.email.trim();
    if !email.contains('@') {
        return Err(Error::InvalidRequest {
            message: "a valid email is required".to_string(),
        });
    }
    let link = subscription::start_checkout(
        &ctx.database,
        &ctx.config,
        provider,
        owner_id,
        email,
        body.tier,
        now,
    )
    .await?;
    info!(owner_id, tier = %body.tier, "Checkout started");
    Ok(link)
}

/// Cancels the caller's subscription.
pub async fn cancel(
    ctx: &ApiContext,
    provider: &dyn BillingProvider,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    subscription::cancel_subscription(&ctx.database, provider, owner_id, now).await
}

/// The caller's current subscription.
pub async fn current(ctx: &ApiContext, owner_id: &str) -> Result<Subscription> {
    subscription::get_subscription(&ctx.database, owner_id).await
}
