//! Credit account entity - One row per owner holding the current balance.
//!
//! Created lazily on first reference and never deleted. Only the ledger
//! (`core::ledger`) writes to this table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Credit account database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "credit_accounts")]
pub struct Model {
    /// External owner identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: String,
    /// Current balance in credits, never negative
    pub balance: i64,
    /// Credits spent since the last period reset
    pub monthly_used: i64,
    /// When the usage counter next resets
    pub reset_at: DateTimeUtc,
    /// When the account was first referenced
    pub created_at: DateTimeUtc,
    /// When the balance or counters last changed
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between `CreditAccount` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One account has many ledger rows
    #[sea_orm(has_many = "super::credit_transaction::Entity")]
    Transactions,
}

impl Related<super::credit_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
