//! Provider credentials and URLs read from environment variables.
//!
//! Secrets never live in the settings file. They are loaded (after `.env` has
//! been read by `dotenvy`) right before the provider client is built.

use crate::config::settings::TierSettings;
use crate::errors::{Error, Result};
use crate::models::Tier;

/// Credentials for the billing provider.
#[derive(Debug, Clone)]
pub struct BillingSecrets {
    /// API secret key
    pub secret_key: String,
    /// Shared secret used to sign webhook payloads
    pub webhook_secret: String,
    /// Public base URL used for checkout success/cancel redirects
    pub app_url: String,
}

impl BillingSecrets {
    /// Reads `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` and `APP_URL`.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when a key or the webhook secret is missing
    /// or blank.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the secrets from any variable lookup; `APP_URL` defaults to
    /// `http://localhost:3000`.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when a key or the webhook secret is missing
    /// or blank.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| Error::Config {
                    message: format!("{key} is not set"),
                })
        };
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            app_url: lookup("APP_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
        })
    }

    /// Redirect after a successful checkout.
    #[must_use]
    pub fn success_url(&self) -> String {
        format!("{}/settings?success=true", self.app_url.trim_end_matches('/'))
    }

    /// Redirect after an abandoned checkout.
    #[must_use]
    pub fn cancel_url(&self) -> String {
        format!("{}/settings?canceled=true", self.app_url.trim_end_matches('/'))
    }
}

/// Environment variable overriding the price id of a paid tier.
const fn price_env_key(tier: Tier) -> Option<&'static str> {
    match tier {
        Tier::Free => None,
        Tier::Pro => Some("STRIPE_PRO_PRICE_ID"),
        Tier::Enterprise => Some("STRIPE_ENTERPRISE_PRICE_ID"),
    }
}

/// Replaces configured price ids with `STRIPE_*_PRICE_ID` values when set.
pub fn apply_price_overrides(tiers: &mut TierSettings) {
    for (tier, plan) in [
        (Tier::Pro, &mut tiers.pro),
        (Tier::Enterprise, &mut tiers.enterprise),
    ] {
        if let Some(value) = price_env_key(tier)
            .and_then(|key| std::env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
        {
            plan.price_id = Some(value);
        }
    }
}
