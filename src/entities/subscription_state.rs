//! Subscription state entity - Tier and billing status per owner.
//!
//! Mutated only by the subscription state machine (`core::subscription`).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Subscription state database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subscription_states")]
pub struct Model {
    /// External owner identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: String,
    /// `"free"`, `"pro"` or `"enterprise"`
    pub tier: String,
    /// `"inactive"`, `"active"`, `"past_due"` or `"cancelled"`
    pub status: String,
    /// Billing provider customer id, set on first checkout
    pub provider_customer_id: Option<String>,
    /// Billing provider subscription id while a paid subscription exists
    #[sea_orm(unique)]
    pub provider_subscription_id: Option<String>,
    /// End of the currently paid period
    pub period_end: Option<DateTimeUtc>,
    /// When the state last changed
    pub updated_at: DateTimeUtc,
}

/// `SubscriptionState` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
