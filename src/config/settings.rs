//! Application settings loaded from a TOML file.
//!
//! Every section has defaults, so an absent or partial file still yields a
//! usable configuration. Provider price ids may be overridden from the
//! environment (see [`crate::config::secrets`]).

use crate::errors::{Error, Result};
use crate::models::Tier;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Configuration structure representing the entire settings file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Credit allotments and provider prices per tier
    pub tiers: TierSettings,
    /// Ledger period and generation cost
    pub ledger: LedgerSettings,
    /// Scheduled-task quota and retry policy
    pub queue: QueueSettings,
    /// Dispatcher polling loop
    pub dispatcher: DispatcherSettings,
    /// Store retry policy
    pub store: StoreSettings,
}

/// Settings for a single tier
#[derive(Debug, Clone, Deserialize)]
pub struct TierPlan {
    /// Credits granted per billing period
    pub monthly_credits: i64,
    /// Billing provider price id; only paid tiers have one
    #[serde(default)]
    pub price_id: Option<String>,
}

/// Settings for all tiers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TierSettings {
    /// Free tier, also the opening balance and the floor after cancellation
    pub free: TierPlan,
    /// Pro tier
    pub pro: TierPlan,
    /// Enterprise tier
    pub enterprise: TierPlan,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            free: TierPlan {
                monthly_credits: 500,
                price_id: None,
            },
            pro: TierPlan {
                monthly_credits: 2500,
                price_id: None,
            },
            enterprise: TierPlan {
                monthly_credits: 10_000,
                price_id: None,
            },
        }
    }
}

impl TierSettings {
    /// Settings for `tier`.
    #[must_use]
    pub const fn plan(&self, tier: Tier) -> &TierPlan {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }

    /// Monthly credit allotment for `tier`.
    #[must_use]
    pub const fn allotment(&self, tier: Tier) -> i64 {
        self.plan(tier).monthly_credits
    }

    /// Resolves a provider price id to the paid tier it sells.
    #[must_use]
    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        [Tier::Pro, Tier::Enterprise]
            .into_iter()
            .find(|tier| self.plan(*tier).price_id.as_deref() == Some(price_id))
    }
}

/// Ledger settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Length of a usage period in calendar months
    pub period_months: u32,
    /// Credits charged per generation request
    pub generation_cost: i64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            period_months: 1,
            generation_cost: 1,
        }
    }
}

/// Scheduled-task queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum counted tasks per owner per calendar month
    pub monthly_quota: u64,
    /// Claims allowed before a failing task becomes terminal
    pub max_attempts: i32,
    /// Seconds after which an unreported claim may be reclaimed
    pub stale_claim_secs: i64,
    /// Page size for task listings when the caller gives none
    pub default_list_limit: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            monthly_quota: 30,
            max_attempts: 3,
            stale_claim_secs: 900,
            default_list_limit: 50,
        }
    }
}

/// Dispatcher loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Seconds between polls
    pub poll_interval_secs: u64,
    /// Maximum tasks claimed per poll
    pub batch_size: u64,
    /// URL the HTTP publisher posts tasks to
    pub publish_endpoint: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            batch_size: 10,
            publish_endpoint: None,
        }
    }
}

/// Store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Attempts made before a store conflict is surfaced
    pub conflict_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
        }
    }
}

impl AppConfig {
    /// Checks values that would make the core misbehave.
    pub fn validate(&self) -> Result<()> {
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            if self.tiers.allotment(tier) < 0 {
                return Err(Error::Config {
                    message: format!("tiers.{tier}.monthly_credits must not be negative"),
                });
            }
        }
        if self.ledger.period_months == 0 {
            return Err(Error::Config {
                message: "ledger.period_months must be at least 1".to_string(),
            });
        }
        if self.ledger.generation_cost <= 0 {
            return Err(Error::Config {
                message: "ledger.generation_cost must be positive".to_string(),
            });
        }
        if self.queue.max_attempts < 1 {
            return Err(Error::Config {
                message: "queue.max_attempts must be at least 1".to_string(),
            });
        }
        if self.queue.stale_claim_secs <= 0 {
            return Err(Error::Config {
                message: "queue.stale_claim_secs must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads settings from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A value fails validation
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    debug!("Attempting to load configuration from: {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read config file {}: {e}", path_ref.display()),
    })?;

    let config = parse_config(&contents)?;
    Ok(config)
}

/// Parses and validates settings from TOML text.
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse settings: {e}"),
    })?;
    config.validate()?;
    Ok(config)
}

/// Loads settings from `POSTMETER_CONFIG` (default `./config.toml`), applying
/// environment overrides. A missing file yields the defaults.
pub fn load_app_configuration() -> Result<AppConfig> {
    let path = std::env::var("POSTMETER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = if Path::new(&path).exists() {
        load_config(&path)?
    } else {
        info!(path = %path, "No settings file found, using defaults");
        AppConfig::default()
    };
    crate::config::secrets::apply_price_overrides(&mut config.tiers);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [tiers.free]
            monthly_credits = 100

            [tiers.pro]
            monthly_credits = 2500
            price_id = "price_pro"

            [tiers.enterprise]
            monthly_credits = 10000
            price_id = "price_ent"

            [ledger]
            period_months = 1
            generation_cost = 2

            [queue]
            monthly_quota = 10
            max_attempts = 5

            [dispatcher]
            poll_interval_secs = 5
            publish_endpoint = "http://localhost:9000/publish"
        "#;

        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.tiers.allotment(Tier::Free), 100);
        assert_eq!(config.tiers.tier_for_price("price_ent"), Some(Tier::Enterprise));
        assert_eq!(config.tiers.tier_for_price("price_unknown"), None);
        assert_eq!(config.ledger.generation_cost, 2);
        assert_eq!(config.queue.monthly_quota, 10);
        assert_eq!(config.queue.max_attempts, 5);
        // Unset values keep their defaults
        assert_eq!(config.queue.stale_claim_secs, 900);
        assert_eq!(config.store.conflict_retries, 3);
        assert_eq!(
            config.dispatcher.publish_endpoint.as_deref(),
            Some("http://localhost:9000/publish")
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.tiers.allotment(Tier::Free), 500);
        assert_eq!(config.tiers.allotment(Tier::Pro), 2500);
        assert_eq!(config.tiers.allotment(Tier::Enterprise), 10_000);
        assert_eq!(config.queue.monthly_quota, 30);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let result = parse_config("[ledger]\nperiod_months = 0\n");
        assert!(matches!(result, Err(Error::Config { .. })));

        let result = parse_config("[queue]\nmax_attempts = 0\n");
        assert!(matches!(result, Err(Error::Config { .. })));

        let result = parse_config("[queue\n");
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
