//! Checkout session entity - Provider checkout sessions started by owners.
//!
//! A row is written `pending` when the session is created and flipped to
//! `completed` when the matching `checkout_completed` event is applied.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Checkout session database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_sessions")]
pub struct Model {
    /// Provider-assigned session id
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider_session_id: String,
    /// Owner who started the checkout
    pub owner_id: String,
    /// Tier being purchased
    pub tier: String,
    /// `"pending"` or `"completed"`
    pub status: String,
    /// Hosted checkout URL returned by the provider
    pub url: Option<String>,
    /// When the session was created
    pub created_at: DateTimeUtc,
    /// When the completion event was applied
    pub completed_at: Option<DateTimeUtc>,
}

/// No relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
