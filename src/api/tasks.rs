//! Scheduled-task requests: create, edit, list, cancel and delete.
//!
//! Times arrive as ISO-8601 strings and are parsed here; the queue itself only
//! sees `DateTime<Utc>`.

use crate::{
    api::{ApiContext, page_limit, parse_timestamp},
    core::schedule::{self, NewTask, QuotaUsage, TaskEdit},
    errors::Result,
    models::{ScheduledTask, TaskStatus},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

const MAX_PAGE: u64 = 200;

/// Body of a scheduling request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Platform the post goes to
    pub target: String,
    /// Post body
    pub content: String,
    /// Hashtags, with or without the leading `#`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional attachment reference
    #[serde(default, alias = "mediaRef")]
    pub media_ref: Option<String>,
    /// ISO-8601 publish time, strictly in the future
    #[serde(alias = "scheduledFor")]
    pub scheduled_for: String,
}

/// Body of an edit request. Absent fields are left unchanged; an explicit
/// `"media_ref": null` removes the media reference.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditTaskRequest {
    /// New platform
    #[serde(default)]
    pub target: Option<String>,
    /// New post body
    #[serde(default)]
    pub content: Option<String>,
    /// Replacement tag list
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// `Some(None)` when the body carries an explicit `null`
    #[serde(default, alias = "mediaRef", deserialize_with = "present_or_null")]
    pub media_ref: Option<Option<String>>,
    /// New ISO-8601 publish time
    #[serde(default, alias = "scheduledFor")]
    pub scheduled_for: Option<String>,
}

/// Listing filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    /// Only tasks in this state, e.g. `"pending"`
    #[serde(default)]
    pub status: Option<String>,
    /// Page size, capped server-side
    #[serde(default)]
    pub limit: Option<u64>,
}

fn present_or_null<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Trims tags, drops a leading `#` and removes blanks and repeats.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().trim_start_matches('#').trim();
        if !tag.is_empty() && !normalized.iter().any(|t| t == tag) {
            normalized.push(tag.to_string());
        }
    }
    normalized
}

fn normalize_media_ref(media_ref: Option<String>) -> Option<String> {
    media_ref
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}

/// Schedules a new task for the caller.
pub async fn create(
    ctx: &ApiContext,
    owner_id: &str,
    request: CreateTaskRequest,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let task = NewTask {
        scheduled_for: parse_timestamp("scheduled_for", &request.scheduled_for)?,
        target: request.target.trim().to_string(),
        content: request.content,
        tags: normalize_tags(request.tags),
        media_ref: normalize_media_ref(request.media_ref),
    };
    schedule::schedule(&ctx.database, &ctx.config, owner_id, task, now).await
}

/// Edits one of the caller's pending tasks.
pub async fn edit(
    ctx: &ApiContext,
    owner_id: &str,
    task_id: i64,
    request: EditTaskRequest,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let scheduled_for = request
        .scheduled_for
        .as_deref()
        .map(|value| parse_timestamp("scheduled_for", value))
        .transpose()?;
    let changes = TaskEdit {
        target: request.target.map(|t| t.trim().to_string()),
        content: request.content,
        tags: request.tags.map(normalize_tags),
        media_ref: request.media_ref.map(normalize_media_ref),
        scheduled_for,
    };
    schedule::edit(&ctx.database, &ctx.config, owner_id, task_id, changes, now).await
}

/// Lists the caller's tasks, soonest first.
pub async fn list(ctx: &ApiContext, owner_id: &str, query: ListTasksQuery) -> Result<Vec<ScheduledTask>> {
    let status = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    schedule::list_tasks(
        &ctx.database,
        &ctx.config,
        owner_id,
        status,
        page_limit(query.limit, MAX_PAGE),
    )
    .await
}

/// Fetches one of the caller's tasks.
pub async fn get(ctx: &ApiContext, owner_id: &str, task_id: i64) -> Result<ScheduledTask> {
    schedule::get_task(&ctx.database, owner_id, task_id).await
}

/// Cancels one of the caller's pending tasks; the row is kept.
pub async fn cancel(
    ctx: &ApiContext,
    owner_id: &str,
    task_id: i64,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    schedule::cancel_task(&ctx.database, owner_id, task_id, now).await
}

/// Removes one of the caller's pending tasks.
pub async fn delete(ctx: &ApiContext, owner_id: &str, task_id: i64) -> Result<()> {
    schedule::delete_task(&ctx.database, owner_id, task_id).await
}

/// Counted tasks this month against the monthly cap.
pub async fn quota(ctx: &ApiContext, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaUsage> {
    schedule::quota_usage(&ctx.database, &ctx.config, owner_id, now).await
}
