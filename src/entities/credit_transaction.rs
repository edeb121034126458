//! Credit transaction entity - The append-only ledger.
//!
//! Rows are inserted once and never updated. For every owner the sum of
//! `amount` equals the account balance. `kind` holds the string form of
//! [`crate::models::TransactionKind`].
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Credit transaction database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "credit_transactions")]
pub struct Model {
    /// Unique identifier for the transaction
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owner whose balance changed
    pub owner_id: String,
    /// Signed amount (negative for spending, positive for grants)
    pub amount: i64,
    /// `"generation_spend"`, `"subscription_grant"`, `"manual_adjustment"` or `"period_reset"`
    pub kind: String,
    /// Human-readable description
    pub description: String,
    /// Caller-supplied key making a grant apply at most once
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    /// When the row was written
    pub created_at: DateTimeUtc,
}

/// Defines relationships between `CreditTransaction` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each transaction belongs to one account
    #[sea_orm(
        belongs_to = "super::credit_account::Entity",
        from = "Column::OwnerId",
        to = "super::credit_account::Column::OwnerId"
    )]
    Account,
}

impl Related<super::credit_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
