//! Scheduled-task queue - Admission, edits and dispatcher hand-off.
//!
//! Admission is serialised per owner through a guard row in
//! `task_quota_guards`: the guard is bumped before counting, so two
//! concurrent requests for one owner cannot both see room for one more task.
//! Every status change is a conditional `UPDATE` on the previous status, so a
//! lost race surfaces as [`Error::TaskNotEditable`] instead of a lost update.

use crate::{
    config::AppConfig,
    core::store::retry_on_conflict,
    entities::{TaskQuotaGuard, scheduled_task, task_quota_guard},
    errors::{Error, Result},
    models::{ScheduledTask, TaskStatus},
};
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use sea_orm::{
    DatabaseTransaction, PaginatorTrait, QueryOrder, QuerySelect, Set, TransactionTrait,
    prelude::*,
    sea_query::{Expr, OnConflict},
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

type Tasks = scheduled_task::Entity;

/// Error text recorded when a claim outlives `stale_claim_secs`.
pub const CLAIM_EXPIRED: &str = "claim expired";

/// Fields of a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    /// Platform name
    pub target: String,
    /// Post body
    pub content: String,
    /// Normalised hashtags
    pub tags: Vec<String>,
    /// Optional attachment reference
    pub media_ref: Option<String>,
    /// Must be strictly after `now`
    pub scheduled_for: DateTime<Utc>,
}

/// Partial update for a pending task. `None` leaves a field unchanged;
/// `media_ref: Some(None)` clears the media reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEdit {
    /// New platform
    pub target: Option<String>,
    /// New post body
    pub content: Option<String>,
    /// Replacement tag list
    pub tags: Option<Vec<String>>,
    /// New or cleared attachment
    pub media_ref: Option<Option<String>>,
    /// New publish time
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Counted tasks this month against the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    /// Pending and published tasks due this month
    pub used: u64,
    /// `queue.monthly_quota`
    pub limit: u64,
}

/// Start of the UTC calendar month containing `now`, and the start of the next.
pub fn month_bounds(now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| Error::InvalidRequest {
            message: format!("no month start for {now}"),
        })?;
    let end = start
        .checked_add_months(Months::new(1))
        .ok_or_else(|| Error::InvalidRequest {
            message: format!("no month end for {now}"),
        })?;
    Ok((start, end))
}

fn in_month(at: DateTime<Utc>, (start, end): (DateTime<Utc>, DateTime<Utc>)) -> bool {
    start <= at && at < end
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

fn require_future(scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if scheduled_for <= now {
        return Err(Error::InvalidScheduleTime { scheduled_for });
    }
    Ok(())
}

/// Admits a new pending task.
///
/// Fails with [`Error::InvalidScheduleTime`] unless `scheduled_for` is after
/// `now`, and with [`Error::QuotaExceeded`] once the owner already has
/// `monthly_quota` counted tasks in the current month.
#[instrument(skip(db, config, task), fields(platform = %task.target, scheduled_for = %task.scheduled_for))]
pub async fn schedule(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    task: NewTask,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    require_text("owner_id", owner_id)?;
    require_text("target", &task.target)?;
    require_text("content", &task.content)?;
    require_future(task.scheduled_for, now)?;

    let task = &task;
    let created = retry_on_conflict(
        config.store.conflict_retries,
        "schedule",
        move || async move {
            let txn = db.begin().await?;
            match schedule_in(&txn, config, owner_id, task, now).await {
                Ok(created) => {
                    txn.commit().await?;
                    Ok(created)
                }
                Err(err) => {
                    txn.rollback().await?;
                    Err(err)
                }
            }
        },
    )
    .await?;

    info!(task_id = created.id, "Task scheduled");
    Ok(created)
}

async fn schedule_in(
    txn: &DatabaseTransaction,
    config: &AppConfig,
    owner_id: &str,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    lock_owner_quota(txn, owner_id, now).await?;
    ensure_quota_available(txn, config, owner_id, now).await?;

    let model = scheduled_task::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        target: Set(task.target.clone()),
        content: Set(task.content.clone()),
        tags: Set(Json::from(task.tags.clone())),
        media_ref: Set(task.media_ref.clone()),
        scheduled_for: Set(task.scheduled_for),
        status: Set(TaskStatus::Pending.as_str().to_string()),
        attempt_count: Set(0),
        last_error: Set(None),
        claimed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(txn)
    .await?;

    ScheduledTask::try_from(model)
}

/// Bumps the owner's guard row, serialising admissions for that owner until
/// the surrounding transaction ends.
async fn lock_owner_quota<C>(conn: &C, owner_id: &str, now: DateTime<Utc>) -> Result<()>
where
    C: ConnectionTrait,
{
    let guard = task_quota_guard::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        revision: Set(0),
        updated_at: Set(now),
    };
    TaskQuotaGuard::insert(guard)
        .on_conflict(
            OnConflict::column(task_quota_guard::Column::OwnerId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    TaskQuotaGuard::update_many()
        .col_expr(
            task_quota_guard::Column::Revision,
            Expr::col(task_quota_guard::Column::Revision).add(1),
        )
        .col_expr(task_quota_guard::Column::UpdatedAt, Expr::value(now))
        .filter(task_quota_guard::Column::OwnerId.eq(owner_id))
        .exec(conn)
        .await?;
    Ok(())
}

async fn ensure_quota_available<C>(
    conn: &C,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let used = counted_this_month(conn, owner_id, now).await?;
    let limit = config.queue.monthly_quota;
    if used >= limit {
        debug!(owner_id, used, limit, "Monthly task quota reached");
        return Err(Error::QuotaExceeded { used, limit });
    }
    Ok(())
}

async fn counted_this_month<C>(conn: &C, owner_id: &str, now: DateTime<Utc>) -> Result<u64>
where
    C: ConnectionTrait,
{
    let (start, end) = month_bounds(now)?;
    let counted = TaskStatus::COUNTED.map(TaskStatus::as_str);
    Tasks::find()
        .filter(scheduled_task::Column::OwnerId.eq(owner_id))
        .filter(scheduled_task::Column::Status.is_in(counted))
        .filter(scheduled_task::Column::ScheduledFor.gte(start))
        .filter(scheduled_task::Column::ScheduledFor.lt(end))
        .count(conn)
        .await
        .map_err(Into::into)
}

/// Counted tasks for the owner in the month containing `now`.
pub async fn quota_usage(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<QuotaUsage> {
    Ok(QuotaUsage {
        used: counted_this_month(db, owner_id, now).await?,
        limit: config.queue.monthly_quota,
    })
}

/// Applies a partial update to a pending task owned by `owner_id`.
///
/// A task that has left `pending` is rejected with
/// [`Error::TaskNotEditable`] before the new fields are validated. Moving a
/// task into the current month from outside it re-runs the quota check under
/// the owner guard.
#[instrument(skip(db, config, edit))]
pub async fn edit(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    task_id: i64,
    edit: TaskEdit,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let edit = &edit;
    retry_on_conflict(config.store.conflict_retries, "edit", move || async move {
        let txn = db.begin().await?;
        match edit_in(&txn, config, owner_id, task_id, edit, now).await {
            Ok(task) => {
                txn.commit().await?;
                Ok(task)
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    })
    .await
}

async fn edit_in(
    txn: &DatabaseTransaction,
    config: &AppConfig,
    owner_id: &str,
    task_id: i64,
    edit: &TaskEdit,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    // Write before reading so SQLite takes the write lock up front
    lock_owner_quota(txn, owner_id, now).await?;

    let current = find_owned(txn, owner_id, task_id).await?;
    let status: TaskStatus = current.status.parse()?;
    if status != TaskStatus::Pending {
        return Err(Error::TaskNotEditable { status });
    }

    if let Some(target) = &edit.target {
        require_text("target", target)?;
    }
    if let Some(content) = &edit.content {
        require_text("content", content)?;
    }
    if let Some(scheduled_for) = edit.scheduled_for {
        require_future(scheduled_for, now)?;
        let month = month_bounds(now)?;
        if in_month(scheduled_for, month) && !in_month(current.scheduled_for, month) {
            ensure_quota_available(txn, config, owner_id, now).await?;
        }
    }

    let mut update = Tasks::update_many().col_expr(scheduled_task::Column::UpdatedAt, Expr::value(now));
    if let Some(target) = &edit.target {
        update = update.col_expr(scheduled_task::Column::Target, Expr::value(target.clone()));
    }
    if let Some(content) = &edit.content {
        update = update.col_expr(scheduled_task::Column::Content, Expr::value(content.clone()));
    }
    if let Some(tags) = &edit.tags {
        update = update.col_expr(scheduled_task::Column::Tags, Expr::value(Json::from(tags.clone())));
    }
    if let Some(media_ref) = &edit.media_ref {
        update = update.col_expr(scheduled_task::Column::MediaRef, Expr::value(media_ref.clone()));
    }
    if let Some(scheduled_for) = edit.scheduled_for {
        update = update.col_expr(scheduled_task::Column::ScheduledFor, Expr::value(scheduled_for));
    }

    let updated = update
        .filter(scheduled_task::Column::Id.eq(task_id))
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Pending.as_str()))
        .exec(txn)
        .await?;
    if updated.rows_affected == 0 {
        return Err(not_editable(txn, owner_id, task_id).await);
    }

    ScheduledTask::try_from(find_owned(txn, owner_id, task_id).await?)
}

/// Marks a pending task `cancelled`.
#[instrument(skip(db))]
pub async fn cancel_task(
    db: &DatabaseConnection,
    owner_id: &str,
    task_id: i64,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let updated = Tasks::update_many()
        .col_expr(
            scheduled_task::Column::Status,
            Expr::value(TaskStatus::Cancelled.as_str()),
        )
        .col_expr(scheduled_task::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_task::Column::Id.eq(task_id))
        .filter(scheduled_task::Column::OwnerId.eq(owner_id))
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Pending.as_str()))
        .exec(db)
        .await?;
    if updated.rows_affected == 0 {
        return Err(not_editable(db, owner_id, task_id).await);
    }

    info!(task_id, "Task cancelled");
    get_task(db, owner_id, task_id).await
}

/// Physically removes a pending task.
#[instrument(skip(db))]
pub async fn delete_task(db: &DatabaseConnection, owner_id: &str, task_id: i64) -> Result<()> {
    let deleted = Tasks::delete_many()
        .filter(scheduled_task::Column::Id.eq(task_id))
        .filter(scheduled_task::Column::OwnerId.eq(owner_id))
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Pending.as_str()))
        .exec(db)
        .await?;
    if deleted.rows_affected == 0 {
        return Err(not_editable(db, owner_id, task_id).await);
    }

    info!(task_id, "Task deleted");
    Ok(())
}

/// Returns one of the owner's tasks.
pub async fn get_task(db: &DatabaseConnection, owner_id: &str, task_id: i64) -> Result<ScheduledTask> {
    ScheduledTask::try_from(find_owned(db, owner_id, task_id).await?)
}

/// Lists the owner's tasks by ascending `scheduled_for`, optionally filtered
/// by status. `limit` defaults to `queue.default_list_limit`.
pub async fn list_tasks(
    db: &DatabaseConnection,
    config: &AppConfig,
    owner_id: &str,
    status: Option<TaskStatus>,
    limit: Option<u64>,
) -> Result<Vec<ScheduledTask>> {
    let mut query = Tasks::find().filter(scheduled_task::Column::OwnerId.eq(owner_id));
    if let Some(status) = status {
        query = query.filter(scheduled_task::Column::Status.eq(status.as_str()));
    }

    query
        .order_by_asc(scheduled_task::Column::ScheduledFor)
        .order_by_asc(scheduled_task::Column::Id)
        .limit(limit.unwrap_or(config.queue.default_list_limit))
        .all(db)
        .await?
        .into_iter()
        .map(ScheduledTask::try_from)
        .collect()
}

/// Claims up to `limit` due tasks for one dispatcher worker.
///
/// Each candidate moves `pending -> processing` through its own conditional
/// update, so a task is handed to at most one caller even when several
/// workers poll at once. Stale claims are requeued first.
#[instrument(skip(db, config))]
pub async fn claim_due(
    db: &DatabaseConnection,
    config: &AppConfig,
    limit: u64,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledTask>> {
    requeue_stale_claims(db, config, now).await?;
    if limit == 0 {
        return Ok(Vec::new());
    }

    let candidates: Vec<i64> = Tasks::find()
        .select_only()
        .column(scheduled_task::Column::Id)
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Pending.as_str()))
        .filter(scheduled_task::Column::ScheduledFor.lte(now))
        .order_by_asc(scheduled_task::Column::ScheduledFor)
        .order_by_asc(scheduled_task::Column::Id)
        .limit(limit)
        .into_tuple()
        .all(db)
        .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for task_id in candidates {
        let updated = retry_on_conflict(config.store.conflict_retries, "claim_due", move || async move {
            let updated = Tasks::update_many()
                .col_expr(
                    scheduled_task::Column::Status,
                    Expr::value(TaskStatus::Processing.as_str()),
                )
                .col_expr(
                    scheduled_task::Column::AttemptCount,
                    Expr::col(scheduled_task::Column::AttemptCount).add(1),
                )
                .col_expr(scheduled_task::Column::ClaimedAt, Expr::value(now))
                .col_expr(scheduled_task::Column::UpdatedAt, Expr::value(now))
                .filter(scheduled_task::Column::Id.eq(task_id))
                .filter(scheduled_task::Column::Status.eq(TaskStatus::Pending.as_str()))
                .exec(db)
                .await?;
            Ok(updated.rows_affected)
        })
        .await?;
        if updated == 0 {
            // Another worker got there first
            continue;
        }
        if let Some(model) = Tasks::find_by_id(task_id).one(db).await? {
            claimed.push(ScheduledTask::try_from(model)?);
        }
    }

    if !claimed.is_empty() {
        debug!(count = claimed.len(), "Claimed due tasks");
    }
    Ok(claimed)
}

/// Treats claims older than `queue.stale_claim_secs` as failed attempts.
///
/// Returns how many tasks were released.
pub async fn requeue_stale_claims(
    db: &DatabaseConnection,
    config: &AppConfig,
    now: DateTime<Utc>,
) -> Result<u64> {
    let cutoff = now - Duration::seconds(config.queue.stale_claim_secs);
    let stale = Tasks::find()
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Processing.as_str()))
        .filter(scheduled_task::Column::ClaimedAt.lt(cutoff))
        .all(db)
        .await?;

    let mut released = 0;
    for task in stale {
        if let Some(status) = record_failure(db, config, &task, CLAIM_EXPIRED, now).await? {
            warn!(task_id = task.id, status = %status, "Stale claim released");
            released += 1;
        }
    }
    Ok(released)
}

/// `processing -> published`.
#[instrument(skip(db))]
pub async fn report_success(
    db: &DatabaseConnection,
    task_id: i64,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let updated = Tasks::update_many()
        .col_expr(
            scheduled_task::Column::Status,
            Expr::value(TaskStatus::Published.as_str()),
        )
        .col_expr(
            scheduled_task::Column::ClaimedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(scheduled_task::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_task::Column::Id.eq(task_id))
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Processing.as_str()))
        .exec(db)
        .await?;

    let task = find_any(db, task_id).await?;
    if updated.rows_affected == 0 {
        return Err(Error::TaskNotEditable {
            status: task.status.parse()?,
        });
    }

    info!(task_id, "Task published");
    ScheduledTask::try_from(task)
}

/// Records a failed publish attempt.
///
/// The task returns to `pending` for another claim, or becomes `failed` once
/// `attempt_count` has reached `queue.max_attempts`. `last_error` is kept either
/// way.
#[instrument(skip(db, config))]
pub async fn report_failure(
    db: &DatabaseConnection,
    config: &AppConfig,
    task_id: i64,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let task = find_any(db, task_id).await?;
    let status: TaskStatus = task.status.parse()?;
    if status != TaskStatus::Processing {
        return Err(Error::TaskNotEditable { status });
    }

    if record_failure(db, config, &task, error_message, now).await?.is_none() {
        let current = find_any(db, task_id).await?;
        return Err(Error::TaskNotEditable {
            status: current.status.parse()?,
        });
    }

    ScheduledTask::try_from(find_any(db, task_id).await?)
}

/// Writes the outcome of a failed attempt if the task is still in the claim
/// described by `task`. Returns the new status, or `None` if the claim moved on.
async fn record_failure<C>(
    conn: &C,
    config: &AppConfig,
    task: &scheduled_task::Model,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskStatus>>
where
    C: ConnectionTrait,
{
    let next = if task.attempt_count >= config.queue.max_attempts {
        TaskStatus::Failed
    } else {
        TaskStatus::Pending
    };

    let updated = Tasks::update_many()
        .col_expr(scheduled_task::Column::Status, Expr::value(next.as_str()))
        .col_expr(
            scheduled_task::Column::LastError,
            Expr::value(Some(error_message.to_string())),
        )
        .col_expr(
            scheduled_task::Column::ClaimedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(scheduled_task::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_task::Column::Id.eq(task.id))
        .filter(scheduled_task::Column::Status.eq(TaskStatus::Processing.as_str()))
        .filter(scheduled_task::Column::AttemptCount.eq(task.attempt_count))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        return Ok(None);
    }

    if next == TaskStatus::Failed {
        warn!(task_id = task.id, attempts = task.attempt_count, error = error_message, "Task failed permanently");
    } else {
        info!(task_id = task.id, attempt = task.attempt_count, error = error_message, "Task will be retried");
    }
    Ok(Some(next))
}

async fn find_owned<C>(conn: &C, owner_id: &str, task_id: i64) -> Result<scheduled_task::Model>
where
    C: ConnectionTrait,
{
    Tasks::find_by_id(task_id)
        .filter(scheduled_task::Column::OwnerId.eq(owner_id))
        .one(conn)
        .await?
        .ok_or(Error::TaskNotFound { task_id })
}

async fn find_any<C>(conn: &C, task_id: i64) -> Result<scheduled_task::Model>
where
    C: ConnectionTrait,
{
    Tasks::find_by_id(task_id)
        .one(conn)
        .await?
        .ok_or(Error::TaskNotFound { task_id })
}

/// Explains why a conditional write on a pending task touched no row.
async fn not_editable<C>(conn: &C, owner_id: &str, task_id: i64) -> Error
where
    C: ConnectionTrait,
{
    match find_owned(conn, owner_id, task_id).await {
        Ok(task) => match task.status.parse() {
            Ok(status) => Error::TaskNotEditable { status },
            Err(err) => err,
        },
        Err(err) => err,
    }
}
