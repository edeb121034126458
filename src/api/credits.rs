//! Credit balance and history queries.

use crate::{
    api::{ApiContext, page_limit},
    core::ledger,
    entities::credit_transaction,
    errors::Result,
    models::{AccountSummary, TransactionKind},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_HISTORY: u64 = 200;

/// One ledger row as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    /// Ledger row id
    pub id: i64,
    /// Signed credit change
    pub amount: i64,
    /// Why the balance moved
    pub kind: TransactionKind,
    /// Human-readable reason
    pub description: String,
    /// When the row was appended
    pub created_at: DateTime<Utc>,
}

impl TryFrom<credit_transaction::Model> for TransactionView {
    type Error = crate::errors::Error;

    fn try_from(model: credit_transaction::Model) -> Result<Self> {
        Ok(Self {
            id: model.id,
            amount: model.amount,
            kind: model.kind.parse()?,
            description: model.description,
            created_at: model.created_at,
        })
    }
}

/// Balance, tier, status and usage for the caller.
pub async fn summary(ctx: &ApiContext, owner_id: &str, now: DateTime<Utc>) -> Result<AccountSummary> {
    ledger::account_summary(&ctx.database, &ctx.config, owner_id, now).await
}

/// The caller's ledger rows, newest first.
pub async fn history(
    ctx: &ApiContext,
    owner_id: &str,
    limit: Option<u64>,
) -> Result<Vec<TransactionView>> {
    let limit = page_limit(limit, MAX_HISTORY).unwrap_or(ctx.config.queue.default_list_limit);
    ledger::transactions_for_owner(&ctx.database, owner_id, Some(limit))
        .await?
        .into_iter()
        .map(TransactionView::try_from)
        .collect()
}
