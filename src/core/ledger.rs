//! Credit ledger - Balances and the append-only transaction log.
//!
//! Every balance change happens in the same store transaction as the ledger row
//! that explains it, so for every owner `balance == sum(amount)` holds at all
//! times. Balance updates are single conditional `UPDATE` statements
//! (`balance = balance - n WHERE balance >= n`), which keeps the read-check-write
//! indivisible for concurrent callers on any backend. Accounts are created
//! lazily with the free-tier allotment, recorded as an opening grant.

use crate::{
    config::AppConfig,
    core::store::retry_on_conflict,
    entities::{CreditAccount, CreditTransaction, credit_account, credit_transaction},
    errors::{Error, Result},
    models::{AccountSummary, Tier, TransactionKind},
};
use chrono::{DateTime, Months, Utc};
use sea_orm::{
    QueryOrder, QuerySelect, Set, TransactionTrait,
    prelude::*,
    sea_query::{Expr, OnConflict},
};
use tracing::{debug, info, instrument, warn};

/// Identifier of a ledger row.
pub type TransactionId = i64;

/// A balance change requested through [`grant`].
#[derive(Debug, Clone, Copy)]
pub struct Grant<'a> {
    /// Owner receiving the change
    pub owner_id: &'a str,
    /// Signed amount; only `ManualAdjustment` may be negative
    pub amount: i64,
    /// `SubscriptionGrant` or `ManualAdjustment`
    pub kind: TransactionKind,
    /// Description stored on the ledger row
    pub reason: &'a str,
    /// Applying the same key twice returns the first row's id without effect
    pub idempotency_key: Option<&'a str>,
}

/// Result of comparing an owner's balance with their ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Owner checked
    pub owner_id: String,
    /// Balance column
    pub balance: i64,
    /// Sum of all ledger rows
    pub ledger_sum: i64,
}

impl Reconciliation {
    /// Whether the balance equals the replayed ledger.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// Deducts `amount` credits for a generation request.
///
/// Applies a due period reset first, then atomically checks and decrements the
/// balance, increments `monthly_used`, and appends a `generation_spend` row of
/// `-amount`. Fails with [`Error::InsufficientCredits`] without mutating
/// anything when the balance does not cover `amount`.
#[instrument(skip(db, config))]
pub async fn deduct(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    amount: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<TransactionId> {
    if amount <= 0 {
        return Err(Error::InvalidAmount { amount });
    }

    reset_period(db, config, owner_id, now).await?;

    retry_on_conflict(config.store.conflict_retries, "deduct", move || {
        deduct_once(db, config, owner_id, amount, reason, now)
    })
    .await
}

async fn deduct_once(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    amount: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<TransactionId> {
    let txn = db.begin().await?;
    ensure_account(&txn, config, owner_id, now).await?;

    let updated = CreditAccount::update_many()
        .col_expr(
            credit_account::Column::Balance,
            Expr::col(credit_account::Column::Balance).sub(amount),
        )
        .col_expr(
            credit_account::Column::MonthlyUsed,
            Expr::col(credit_account::Column::MonthlyUsed).add(amount),
        )
        .col_expr(credit_account::Column::UpdatedAt, Expr::value(now))
        .filter(credit_account::Column::OwnerId.eq(owner_id))
        .filter(credit_account::Column::Balance.gte(amount))
        .exec(&txn)
        .await?;

    if updated.rows_affected == 0 {
        let balance = current_balance(&txn, owner_id).await?;
        txn.rollback().await?;
        debug!(owner_id, balance, amount, "Deduction refused");
        return Err(Error::InsufficientCredits {
            balance,
            required: amount,
        });
    }

    let row = append(
        &txn,
        owner_id,
        -amount,
        TransactionKind::GenerationSpend,
        reason,
        None,
        now,
    )
    .await?;
    txn.commit().await?;

    debug!(owner_id, amount, transaction_id = row.id, "Credits deducted");
    Ok(row.id)
}

/// Grants (or, for manual adjustments, removes) credits.
///
/// With an idempotency key the grant applies at most once; repeated calls
/// return the id of the row written by the first call.
#[instrument(skip(db, config))]
pub async fn grant(
    db: &DatabaseConnection,
    config: &AppConfig,
    grant: Grant<'_>,
    now: DateTime<Utc>,
) -> Result<TransactionId> {
    retry_on_conflict(config.store.conflict_retries, "grant", move || async move {
        let txn = db.begin().await?;
        let id = grant_in(&txn, config, &grant, now).await?;
        txn.commit().await?;
        Ok(id)
    })
    .await
}

/// [`grant`] inside a caller-owned transaction.
pub(crate) async fn grant_in<C>(
    conn: &C,
    config: &AppConfig,
    grant: &Grant<'_>,
    now: DateTime<Utc>,
) -> Result<TransactionId>
where
    C: ConnectionTrait,
{
    match grant.kind {
        TransactionKind::SubscriptionGrant if grant.amount > 0 => {}
        TransactionKind::ManualAdjustment if grant.amount != 0 => {}
        TransactionKind::SubscriptionGrant | TransactionKind::ManualAdjustment => {
            return Err(Error::InvalidAmount {
                amount: grant.amount,
            });
        }
        TransactionKind::GenerationSpend | TransactionKind::PeriodReset => {
            return Err(Error::InvalidRequest {
                message: format!("{} rows cannot be granted", grant.kind),
            });
        }
    }

    let account = ensure_account(conn, config, grant.owner_id, now).await?;

    let row_id = match grant.idempotency_key {
        Some(key) => {
            let inserted = CreditTransaction::insert(new_row(
                grant.owner_id,
                grant.amount,
                grant.kind,
                grant.reason,
                Some(key),
                now,
            ))
            .on_conflict(
                OnConflict::column(credit_transaction::Column::IdempotencyKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
            let row = find_by_idempotency_key(conn, key).await?;
            if inserted == 0 {
                debug!(owner_id = grant.owner_id, key, "Grant already applied");
                return Ok(row.id);
            }
            row.id
        }
        None => {
            append(
                conn,
                grant.owner_id,
                grant.amount,
                grant.kind,
                grant.reason,
                None,
                now,
            )
            .await?
            .id
        }
    };

    let updated = CreditAccount::update_many()
        .col_expr(
            credit_account::Column::Balance,
            Expr::col(credit_account::Column::Balance).add(grant.amount),
        )
        .col_expr(credit_account::Column::UpdatedAt, Expr::value(now))
        .filter(credit_account::Column::OwnerId.eq(grant.owner_id))
        .filter(credit_account::Column::Balance.gte(-grant.amount))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        // Only reachable for negative adjustments larger than the balance;
        // the caller's transaction is abandoned, taking the ledger row with it.
        return Err(Error::InsufficientCredits {
            balance: account.balance,
            required: -grant.amount,
        });
    }

    info!(
        owner_id = grant.owner_id,
        amount = grant.amount,
        kind = %grant.kind,
        transaction_id = row_id,
        "Credits granted"
    );
    Ok(row_id)
}

/// Moves the balance to exactly `target` with one `manual_adjustment` row.
///
/// The balance is written with a previous-value check; if another writer got in
/// between, the call fails with [`Error::StoreConflict`] so the enclosing unit
/// can be retried.
pub(crate) async fn set_balance_in<C>(
    conn: &C,
    config: &AppConfig,
    owner_id: &str,
    target: i64,
    reason: &str,
    idempotency_key: &str,
    now: DateTime<Utc>,
) -> Result<TransactionId>
where
    C: ConnectionTrait,
{
    if target < 0 {
        return Err(Error::InvalidAmount { amount: target });
    }

    let account = ensure_account(conn, config, owner_id, now).await?;
    let delta = target - account.balance;

    let inserted = CreditTransaction::insert(new_row(
        owner_id,
        delta,
        TransactionKind::ManualAdjustment,
        reason,
        Some(idempotency_key),
        now,
    ))
    .on_conflict(
        OnConflict::column(credit_transaction::Column::IdempotencyKey)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await?;
    let row = find_by_idempotency_key(conn, idempotency_key).await?;
    if inserted == 0 {
        return Ok(row.id);
    }

    let updated = CreditAccount::update_many()
        .col_expr(credit_account::Column::Balance, Expr::value(target))
        .col_expr(credit_account::Column::UpdatedAt, Expr::value(now))
        .filter(credit_account::Column::OwnerId.eq(owner_id))
        .filter(credit_account::Column::Balance.eq(account.balance))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        return Err(Error::StoreConflict {
            message: format!("balance of {owner_id} changed during adjustment"),
        });
    }

    info!(owner_id, from = account.balance, to = target, "Balance set");
    Ok(row.id)
}

/// Resets the monthly usage counter if `reset_at` has passed.
///
/// Writes a zero-amount `period_reset` marker and moves `reset_at` past `now`.
/// Balance top-ups are separate grants and never implied by a reset. Returns
/// `None` when no reset was due.
pub async fn reset_period(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TransactionId>> {
    if get_account(db, owner_id)
        .await?
        .is_some_and(|account| now < account.reset_at)
    {
        return Ok(None);
    }

    retry_on_conflict(
        config.store.conflict_retries,
        "reset_period",
        move || async move {
            let txn = db.begin().await?;
            let marker = reset_period_in(&txn, config, owner_id, now).await?;
            txn.commit().await?;
            Ok(marker)
        },
    )
    .await
}

async fn reset_period_in<C>(
    conn: &C,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TransactionId>>
where
    C: ConnectionTrait,
{
    let account = ensure_account(conn, config, owner_id, now).await?;
    if now < account.reset_at {
        return Ok(None);
    }

    let next_reset = next_reset_after(account.reset_at, config.ledger.period_months, now)?;
    let updated = CreditAccount::update_many()
        .col_expr(credit_account::Column::MonthlyUsed, Expr::value(0_i64))
        .col_expr(credit_account::Column::ResetAt, Expr::value(next_reset))
        .col_expr(credit_account::Column::UpdatedAt, Expr::value(now))
        .filter(credit_account::Column::OwnerId.eq(owner_id))
        .filter(credit_account::Column::ResetAt.eq(account.reset_at))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        // Someone else reset this period first
        return Ok(None);
    }

    let row = append(
        conn,
        owner_id,
        0,
        TransactionKind::PeriodReset,
        &format!("Monthly usage reset ({} used)", account.monthly_used),
        None,
        now,
    )
    .await?;

    info!(owner_id, next_reset = %next_reset, "Usage period reset");
    Ok(Some(row.id))
}

/// First period boundary strictly after `now`, stepping from `reset_at`.
pub(crate) fn next_reset_after(
    reset_at: DateTime<Utc>,
    period_months: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let step = Months::new(period_months.max(1));
    let mut next = reset_at;
    while next <= now {
        next = next.checked_add_months(step).ok_or_else(|| Error::Config {
            message: format!("reset date after {next} is out of range"),
        })?;
    }
    Ok(next)
}

/// Returns the owner's account, creating it with the free-tier opening balance.
///
/// Always issues the insert, so the first statement of the enclosing
/// transaction is a write.
pub(crate) async fn ensure_account<C>(
    conn: &C,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<credit_account::Model>
where
    C: ConnectionTrait,
{
    let opening_balance = config.tiers.allotment(Tier::Free);
    let reset_at = now
        .checked_add_months(Months::new(config.ledger.period_months))
        .ok_or_else(|| Error::Config {
            message: "first reset date is out of range".to_string(),
        })?;
    let account = credit_account::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        balance: Set(opening_balance),
        monthly_used: Set(0),
        reset_at: Set(reset_at),
        created_at: Set(now),
        updated_at: Set(now),
    };

    // Insert first so SQLite takes the write lock before any read. Two first
    // references may race; only the winner writes the opening row.
    let inserted = CreditAccount::insert(account)
        .on_conflict(
            OnConflict::column(credit_account::Column::OwnerId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    if inserted > 0 {
        append(
            conn,
            owner_id,
            opening_balance,
            TransactionKind::SubscriptionGrant,
            "Opening free tier balance",
            None,
            now,
        )
        .await?;
        info!(owner_id, opening_balance, "Credit account created");
    }

    CreditAccount::find_by_id(owner_id)
        .one(conn)
        .await?
        .ok_or_else(|| Error::Database(DbErr::RecordNotFound(format!("credit account {owner_id}"))))
}

/// Returns the owner's account without creating it.
pub async fn get_account(
    db: &DatabaseConnection,
    owner_id: &str,
) -> Result<Option<credit_account::Model>> {
    CreditAccount::find_by_id(owner_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Ledger query: balance, tier, status, usage and next reset for an owner.
///
/// Creates the account on first reference and applies a due period reset.
pub async fn account_summary(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<AccountSummary> {
    reset_period(db, config, owner_id, now).await?;
    let account = get_account(db, owner_id)
        .await?
        .ok_or_else(|| Error::Database(DbErr::RecordNotFound(format!("credit account {owner_id}"))))?;
    let subscription = crate::core::subscription::get_subscription(db, owner_id).await?;

    Ok(AccountSummary {
        balance: account.balance,
        tier: subscription.tier,
        status: subscription.status,
        monthly_used: account.monthly_used,
        reset_at: account.reset_at,
    })
}

/// Retrieves an owner's ledger rows, newest first.
pub async fn transactions_for_owner(
    db: &DatabaseConnection,
    owner_id: &str,
    limit: Option<u64>,
) -> Result<Vec<credit_transaction::Model>> {
    let mut query = CreditTransaction::find()
        .filter(credit_transaction::Column::OwnerId.eq(owner_id))
        .order_by_desc(credit_transaction::Column::Id);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    query.all(db).await.map_err(Into::into)
}

/// Compares an owner's balance with the sum of their ledger rows.
pub async fn reconcile(db: &DatabaseConnection, owner_id: &str) -> Result<Reconciliation> {
    let balance = current_balance(db, owner_id).await?;
    let ledger_sum = ledger_sum(db, owner_id).await?;
    Ok(Reconciliation {
        owner_id: owner_id.to_string(),
        balance,
        ledger_sum,
    })
}

/// Reconciles every account and returns the inconsistent ones.
pub async fn reconcile_all(db: &DatabaseConnection) -> Result<Vec<Reconciliation>> {
    let accounts = CreditAccount::find()
        .order_by_asc(credit_account::Column::OwnerId)
        .all(db)
        .await?;

    let mut mismatches = Vec::new();
    for account in accounts {
        let ledger_sum = ledger_sum(db, &account.owner_id).await?;
        let check = Reconciliation {
            owner_id: account.owner_id,
            balance: account.balance,
            ledger_sum,
        };
        if !check.is_consistent() {
            warn!(
                owner_id = %check.owner_id,
                balance = check.balance,
                ledger_sum = check.ledger_sum,
                "Balance does not match ledger"
            );
            mismatches.push(check);
        }
    }
    Ok(mismatches)
}

async fn ledger_sum<C>(conn: &C, owner_id: &str) -> Result<i64>
where
    C: ConnectionTrait,
{
    // Summed here rather than with SQL SUM, whose result type differs per backend
    let amounts: Vec<i64> = CreditTransaction::find()
        .select_only()
        .column(credit_transaction::Column::Amount)
        .filter(credit_transaction::Column::OwnerId.eq(owner_id))
        .into_tuple()
        .all(conn)
        .await?;
    Ok(amounts.into_iter().sum())
}

async fn current_balance<C>(conn: &C, owner_id: &str) -> Result<i64>
where
    C: ConnectionTrait,
{
    Ok(CreditAccount::find_by_id(owner_id)
        .one(conn)
        .await?
        .map_or(0, |account| account.balance))
}

async fn find_by_idempotency_key<C>(conn: &C, key: &str) -> Result<credit_transaction::Model>
where
    C: ConnectionTrait,
{
    CreditTransaction::find()
        .filter(credit_transaction::Column::IdempotencyKey.eq(key))
        .one(conn)
        .await?
        .ok_or_else(|| Error::Database(DbErr::RecordNotFound(format!("ledger row for key {key}"))))
}

fn new_row(
    owner_id: &str,
    amount: i64,
    kind: TransactionKind,
    description: &str,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> credit_transaction::ActiveModel {
    credit_transaction::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        amount: Set(amount),
        kind: Set(kind.as_str().to_string()),
        description: Set(description.to_string()),
        idempotency_key: Set(idempotency_key.map(str::to_string)),
        created_at: Set(now),
        ..Default::default()
    }
}

async fn append<C>(
    conn: &C,
    owner_id: &str,
    amount: i64,
    kind: TransactionKind,
    description: &str,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<credit_transaction::Model>
where
    C: ConnectionTrait,
{
    new_row(owner_id, amount, kind, description, idempotency_key, now)
        .insert(conn)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use chrono::Duration;
    use futures_util::future::join_all;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_deduct_rejects_non_positive_amounts() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Sqlite).into_connection();
        let config = test_config();

        for amount in [0, -5] {
            let result = deduct(&db, &config, "owner", amount, "test", fixed_now()).await;
            assert!(matches!(result, Err(Error::InvalidAmount { amount: a }) if a == amount));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_first_reference_creates_account_with_opening_grant() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        let summary = account_summary(&db, &config, "alice", fixed_now()).await?;
        assert_eq!(summary.balance, 500);
        assert_eq!(summary.tier, Tier::Free);
        assert_eq!(summary.monthly_used, 0);
        assert_eq!(summary.reset_at, fixed_now() + Months::new(1));

        let rows = transactions_for_owner(&db, "alice", None).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "subscription_grant");
        assert_eq!(rows[0].amount, 500);
        assert!(reconcile(&db, "alice").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_deduct_updates_balance_usage_and_ledger() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        let id = deduct(&db, &config, "alice", 3, "Generated content", fixed_now()).await?;

        let account = get_account(&db, "alice").await?.unwrap();
        assert_eq!(account.balance, 497);
        assert_eq!(account.monthly_used, 3);

        let rows = transactions_for_owner(&db, "alice", Some(1)).await?;
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].amount, -3);
        assert_eq!(rows[0].kind, "generation_spend");
        assert_eq!(rows[0].description, "Generated content");
        assert!(reconcile(&db, "alice").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_deduct_on_last_credit_fails() -> Result<()> {
        let db = setup_test_db().await?;
        let config = config_with_free_credits(1);

        deduct(&db, &config, "bob", 1, "first", fixed_now()).await?;
        assert_eq!(get_account(&db, "bob").await?.unwrap().balance, 0);

        let result = deduct(&db, &config, "bob", 1, "second", fixed_now()).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCredits {
                balance: 0,
                required: 1
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_refused_deduct_writes_nothing() -> Result<()> {
        let db = setup_test_db().await?;
        let config = config_with_free_credits(2);

        let result = deduct(&db, &config, "carol", 5, "too much", fixed_now()).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCredits {
                balance: 2,
                required: 5
            })
        ));

        let account = get_account(&db, "carol").await?.unwrap();
        assert_eq!(account.balance, 2);
        assert_eq!(account.monthly_used, 0);
        assert_eq!(transactions_for_owner(&db, "carol", None).await?.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deducts_never_overdraw() -> Result<()> {
        const WORKERS: i64 = 8;
        const AMOUNT: i64 = 3;

        let (_dir, db) = setup_file_test_db().await?;
        let config = config_with_free_credits(AMOUNT * (WORKERS - 1));

        // Create the account up front so every worker races on the same row
        ensure_account(&db, &config, "dave", fixed_now()).await?;

        let results = join_all(
            (0..WORKERS).map(|_| deduct(&db, &config, "dave", AMOUNT, "race", fixed_now())),
        )
        .await;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(Error::InsufficientCredits { .. })))
            .count();
        assert_eq!(succeeded, usize::try_from(WORKERS - 1).unwrap());
        assert_eq!(refused, 1);

        let account = get_account(&db, "dave").await?.unwrap();
        assert_eq!(account.balance, 0);
        assert!(reconcile(&db, "dave").await?.is_consistent());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_spends_are_refused_only_for_credits() -> Result<()> {
        let (_dir, db) = setup_file_test_db().await?;
        let config = config_with_free_credits(15);

        // No account yet: every worker also races to open it
        let results = join_all((0..16).map(|_| deduct(&db, &config, "fern", 1, "race", fixed_now()))).await;

        assert!(
            !results
                .iter()
                .any(|r| matches!(r, Err(Error::StoreConflict { .. }))),
            "lock contention leaked out as a conflict: {results:?}"
        );
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 15);
        assert!(matches!(
            results.iter().find(|r| r.is_err()),
            Some(Err(Error::InsufficientCredits {
                balance: 0,
                required: 1
            }))
        ));

        let account = get_account(&db, "fern").await?.unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.monthly_used, 15);
        assert_eq!(transactions_for_owner(&db, "fern", None).await?.len(), 16);
        assert!(reconcile(&db, "fern").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_grant_with_idempotency_key_applies_once() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        let request = Grant {
            owner_id: "erin",
            amount: 2500,
            kind: TransactionKind::SubscriptionGrant,
            reason: "pro subscription activated",
            idempotency_key: Some("checkout-1"),
        };

        let first = grant(&db, &config, request, fixed_now()).await?;
        let second = grant(&db, &config, request, fixed_now()).await?;

        assert_eq!(first, second);
        assert_eq!(get_account(&db, "erin").await?.unwrap().balance, 3000);
        assert!(reconcile(&db, "erin").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_grant_rejects_spend_and_reset_kinds() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        for kind in [TransactionKind::GenerationSpend, TransactionKind::PeriodReset] {
            let result = grant(
                &db,
                &config,
                Grant {
                    owner_id: "frank",
                    amount: 10,
                    kind,
                    reason: "nope",
                    idempotency_key: None,
                },
                fixed_now(),
            )
            .await;
            assert!(matches!(result, Err(Error::InvalidRequest { .. })));
        }

        let result = grant(
            &db,
            &config,
            Grant {
                owner_id: "frank",
                amount: -10,
                kind: TransactionKind::SubscriptionGrant,
                reason: "negative grant",
                idempotency_key: None,
            },
            fixed_now(),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidAmount { amount: -10 })));
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_adjustment_cannot_overdraw() -> Result<()> {
        let db = setup_test_db().await?;
        let config = config_with_free_credits(10);

        let result = grant(
            &db,
            &config,
            Grant {
                owner_id: "gina",
                amount: -11,
                kind: TransactionKind::ManualAdjustment,
                reason: "correction",
                idempotency_key: None,
            },
            fixed_now(),
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCredits {
                balance: 10,
                required: 11
            })
        ));

        grant(
            &db,
            &config,
            Grant {
                owner_id: "gina",
                amount: -10,
                kind: TransactionKind::ManualAdjustment,
                reason: "correction",
                idempotency_key: None,
            },
            fixed_now(),
        )
        .await?;
        assert_eq!(get_account(&db, "gina").await?.unwrap().balance, 0);
        assert!(reconcile(&db, "gina").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_period_only_when_due() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        let start = fixed_now();

        deduct(&db, &config, "hank", 4, "spend", start).await?;
        assert_eq!(reset_period(&db, &config, "hank", start + Duration::days(3)).await?, None);

        let later = start + Months::new(1) + Duration::hours(1);
        let marker = reset_period(&db, &config, "hank", later).await?;
        assert!(marker.is_some());

        let account = get_account(&db, "hank").await?.unwrap();
        assert_eq!(account.monthly_used, 0);
        assert_eq!(account.balance, 496);
        assert_eq!(account.reset_at, start + Months::new(2));

        let rows = transactions_for_owner(&db, "hank", Some(1)).await?;
        assert_eq!(rows[0].kind, "period_reset");
        assert_eq!(rows[0].amount, 0);

        // Already reset for this period
        assert_eq!(reset_period(&db, &config, "hank", later).await?, None);
        assert!(reconcile(&db, "hank").await?.is_consistent());
        Ok(())
    }

    #[test]
    fn test_next_reset_skips_missed_periods() {
        let reset_at = fixed_now();
        let now = reset_at + Months::new(3) + Duration::days(2);
        let next = next_reset_after(reset_at, 1, now).unwrap();
        assert_eq!(next, reset_at + Months::new(4));

        // Boundary instant counts as passed
        let next = next_reset_after(reset_at, 1, reset_at).unwrap();
        assert_eq!(next, reset_at + Months::new(1));
    }

    #[tokio::test]
    async fn test_set_balance_reaches_exact_target() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        grant(
            &db,
            &config,
            Grant {
                owner_id: "ivy",
                amount: 2500,
                kind: TransactionKind::SubscriptionGrant,
                reason: "pro",
                idempotency_key: None,
            },
            fixed_now(),
        )
        .await?;

        let txn = db.begin().await?;
        set_balance_in(&txn, &config, "ivy", 500, "floor", "floor-1", fixed_now()).await?;
        // Same key again is a no-op
        set_balance_in(&txn, &config, "ivy", 500, "floor", "floor-1", fixed_now()).await?;
        txn.commit().await?;

        assert_eq!(get_account(&db, "ivy").await?.unwrap().balance, 500);
        let rows = transactions_for_owner(&db, "ivy", Some(1)).await?;
        assert_eq!(rows[0].amount, -2500);
        assert_eq!(rows[0].kind, "manual_adjustment");
        assert!(reconcile(&db, "ivy").await?.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_all_reports_tampered_balances() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        deduct(&db, &config, "jack", 1, "spend", fixed_now()).await?;
        deduct(&db, &config, "kate", 1, "spend", fixed_now()).await?;
        assert!(reconcile_all(&db).await?.is_empty());

        CreditAccount::update_many()
            .col_expr(credit_account::Column::Balance, Expr::value(1_000_i64))
            .filter(credit_account::Column::OwnerId.eq("kate"))
            .exec(&db)
            .await?;

        let mismatches = reconcile_all(&db).await?;
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].owner_id, "kate");
        assert_eq!(mismatches[0].ledger_sum, 499);
        Ok(())
    }
}
