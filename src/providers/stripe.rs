//! Minimal Stripe client built on reqwest, plus webhook signature checking.

use crate::config::secrets::BillingSecrets;
use crate::errors::{Error, Result};
use crate::providers::{BillingProvider, CheckoutLink, ProviderSubscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error};

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Seconds a signed webhook stays acceptable.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Stripe-backed [`BillingProvider`].
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    success_url: String,
    cancel_url: String,
}

/// A webhook event as delivered by Stripe.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    /// Event id, unique per delivery target
    pub id: String,
    /// Event type, e.g. `invoice.paid`
    #[serde(rename = "type")]
    pub type_: String,
    /// Unix seconds when the event was created
    pub created: Option<i64>,
    /// Event body
    pub data: StripeEventData,
}

/// Wrapper around the object an event is about.
#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    /// The session, subscription or invoice, left untyped
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    customer: Option<String>,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
    #[serde(default)]
    items: StripeSubscriptionItems,
}

#[derive(Debug, Deserialize, Default)]
struct StripeSubscriptionItems {
    data: Vec<StripeSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionItem {
    current_period_end: Option<i64>,
    price: Option<StripePrice>,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    id: String,
}

impl From<StripeSubscription> for ProviderSubscription {
    fn from(subscription: StripeSubscription) -> Self {
        let first_item = subscription.items.data.first();
        // Newer API versions only report the period on the items
        let period_end = subscription
            .current_period_end
            .or_else(|| first_item.and_then(|item| item.current_period_end))
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
        let price_id = first_item
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.clone());
        Self {
            id: subscription.id,
            customer_id: subscription.customer,
            price_id,
            period_end,
            owner_id: subscription
                .metadata
                .get("owner_id")
                .or_else(|| subscription.metadata.get("userId"))
                .cloned(),
        }
    }
}

impl StripeClient {
    /// Builds a client with explicit credentials and redirect URLs.
    #[must_use]
    pub fn new(secret_key: String, success_url: String, cancel_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            success_url,
            cancel_url,
        }
    }

    /// Builds a client from environment secrets.
    #[must_use]
    pub fn from_secrets(secrets: &BillingSecrets) -> Self {
        Self::new(
            secrets.secret_key.clone(),
            secrets.success_url(),
            secrets.cancel_url(),
        )
    }

    async fn ensure_success(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };
        let details = serde_json::from_str::<StripeErrorEnvelope>(&body)
            .ok()
            .map(|envelope| envelope.error);

        error!(
            status = %status,
            stripe_request_id = ?request_id,
            stripe_error_type = ?details.as_ref().and_then(|d| d.type_.as_deref()),
            stripe_error_code = ?details.as_ref().and_then(|d| d.code.as_deref()),
            stripe_error_message = ?details.as_ref().and_then(|d| d.message.as_deref()),
            context = %context,
            "stripe api request failed"
        );

        Err(Error::ProviderUnavailable {
            message: format!("Stripe request failed: {context} (status {status})"),
        })
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(&self, email: &str, owner_id: &str) -> Result<String> {
        let body = [
            ("email", email.to_string()),
            ("metadata[owner_id]", owner_id.to_string()),
        ];
        let resp = self
            .http
            .post(format!("{API_BASE}/customers"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "create customer").await?;

        #[derive(Deserialize)]
        struct CustomerResp {
            id: String,
        }

        let parsed: CustomerResp = resp.json().await?;
        debug!(owner_id, customer_id = %parsed.id, "Created billing customer");
        Ok(parsed.id)
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        owner_id: &str,
    ) -> Result<CheckoutLink> {
        let body = [
            ("mode", "subscription".to_string()),
            ("customer", customer_id.to_string()),
            ("line_items[0][price]", price_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", self.success_url.clone()),
            ("cancel_url", self.cancel_url.clone()),
            ("metadata[owner_id]", owner_id.to_string()),
            ("subscription_data[metadata][owner_id]", owner_id.to_string()),
        ];
        let resp = self
            .http
            .post(format!("{API_BASE}/checkout/sessions"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "create checkout session").await?;

        #[derive(Deserialize)]
        struct CheckoutResp {
            id: String,
            url: Option<String>,
        }

        let parsed: CheckoutResp = resp.json().await?;
        Ok(CheckoutLink {
            session_id: parsed.id,
            url: parsed.url,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
        let body = [("cancel_at_period_end", "true")];
        let resp = self
            .http
            .post(format!("{API_BASE}/subscriptions/{subscription_id}"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await?;
        Self::ensure_success(resp, "cancel subscription").await?;
        Ok(())
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        let resp = self
            .http
            .get(format!("{API_BASE}/subscriptions/{subscription_id}"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "retrieve subscription").await?;

        let subscription: StripeSubscription = resp.json().await?;
        Ok(subscription.into())
    }
}

/// Verifies a `Stripe-Signature` header and parses the event.
///
/// The header carries `t=<unix seconds>` and one or more `v1=<hex>` HMAC-SHA256
/// signatures of `"{t}.{payload}"`. Signatures older than
/// [`SIGNATURE_TOLERANCE_SECS`] are rejected.
pub fn verify_webhook(
    webhook_secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: DateTime<Utc>,
) -> Result<StripeEvent> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("t=") {
            timestamp = rest.parse().ok();
        } else if let Some(rest) = part.strip_prefix("v1=") {
            signatures.push(rest);
        }
    }

    let timestamp = timestamp.ok_or_else(|| invalid_signature("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(invalid_signature("missing v1 signature"));
    }
    if (now.timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(invalid_signature("timestamp outside tolerance"));
    }

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| invalid_signature("unusable webhook secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|signature| {
        hex::decode(signature)
            .map(|provided| mac.clone().verify_slice(&provided).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err(invalid_signature("signature mismatch"));
    }

    serde_json::from_slice(payload).map_err(|e| Error::InvalidRequest {
        message: format!("malformed webhook payload: {e}"),
    })
}

fn invalid_signature(detail: &str) -> Error {
    Error::InvalidRequest {
        message: format!("invalid webhook signature: {detail}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"invoice.paid","created":1,"data":{"object":{"subscription":"sub_1"}}}"#;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_900_000_000, 0).unwrap()
    }

    #[test]
    fn test_client_from_secrets_uses_app_redirects() {
        let secrets = BillingSecrets {
            secret_key: "sk_test_42".to_string(),
            webhook_secret: SECRET.to_string(),
            app_url: "https://postmeter.app/".to_string(),
        };
        let client = StripeClient::from_secrets(&secrets);
        assert_eq!(client.secret_key, "sk_test_42");
        assert_eq!(client.success_url, "https://postmeter.app/settings?success=true");
        assert_eq!(client.cancel_url, "https://postmeter.app/settings?canceled=true");
    }

    #[test]
    fn test_valid_signature_parses_event() {
        let header = sign_payload(SECRET, now().timestamp(), PAYLOAD);
        let event = verify_webhook(SECRET, PAYLOAD, &header, now()).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.type_, "invoice.paid");
        assert_eq!(event.data.object["subscription"], "sub_1");
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let header = sign_payload(SECRET, now().timestamp(), PAYLOAD);
        let tampered = br#"{"id":"evt_2","type":"invoice.paid","data":{"object":{}}}"#;
        let result = verify_webhook(SECRET, tampered, &header, now());
        assert!(matches!(result, Err(Error::InvalidRequest { .. })));
    }

    #[test]
    fn test_old_signature_is_rejected() {
        let header = sign_payload(SECRET, now().timestamp() - SIGNATURE_TOLERANCE_SECS - 1, PAYLOAD);
        let result = verify_webhook(SECRET, PAYLOAD, &header, now());
        assert!(matches!(result, Err(Error::InvalidRequest { message }) if message.contains("tolerance")));
    }

    #[test]
    fn test_any_matching_v1_signature_is_accepted() {
        let signed = sign_payload(SECRET, now().timestamp(), PAYLOAD);
        let header = signed.replacen(",v1=", ",v1=00ff,v1=", 1);
        assert!(verify_webhook(SECRET, PAYLOAD, &header, now()).is_ok());
    }

    #[test]
    fn test_missing_parts_are_rejected() {
        assert!(verify_webhook(SECRET, PAYLOAD, "v1=abcd", now()).is_err());
        assert!(verify_webhook(SECRET, PAYLOAD, "t=1900000000", now()).is_err());
    }

    #[test]
    fn test_subscription_period_falls_back_to_items() {
        let raw: StripeSubscription = serde_json::from_str(
            r#"{"id":"sub_1","customer":"cus_1","metadata":{"owner_id":"alice"},
               "items":{"data":[{"current_period_end":1900000000,"price":{"id":"price_pro"}}]}}"#,
        )
        .unwrap();
        let subscription = ProviderSubscription::from(raw);
        assert_eq!(subscription.price_id.as_deref(), Some("price_pro"));
        assert_eq!(subscription.owner_id.as_deref(), Some("alice"));
        assert_eq!(subscription.period_end, Some(now()));
    }
}
