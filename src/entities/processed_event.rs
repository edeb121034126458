//! Processed event entity - One row per applied billing-provider event.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Processed event database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_events")]
pub struct Model {
    /// Provider-assigned event id, globally unique
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider_event_id: String,
    /// Normalised event kind, kept for auditing
    pub event_kind: String,
    /// When the event's effects were committed
    pub processed_at: DateTimeUtc,
}

/// No relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
