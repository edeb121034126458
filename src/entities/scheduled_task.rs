//! Scheduled task entity - Future-dated publish tasks.
//!
//! `status` holds the string form of [`crate::models::TaskStatus`]; `tags` is a
//! JSON array of strings. `claimed_at` is set while a dispatcher worker holds
//! the task and lets stale claims be detected.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Scheduled task database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scheduled_tasks")]
pub struct Model {
    /// Unique identifier for the task
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owner who scheduled the task
    pub owner_id: String,
    /// Platform identifier to publish to
    pub target: String,
    /// Text to publish
    pub content: String,
    /// Ordered tags, stored as a JSON array
    pub tags: Json,
    /// Optional media reference
    pub media_ref: Option<String>,
    /// When the task becomes due
    pub scheduled_for: DateTimeUtc,
    /// Lifecycle status
    pub status: String,
    /// Number of times the task has been claimed
    pub attempt_count: i32,
    /// Message from the last failed attempt
    pub last_error: Option<String>,
    /// When the current claim was taken
    pub claimed_at: Option<DateTimeUtc>,
    /// When the task was created
    pub created_at: DateTimeUtc,
    /// When the task last changed
    pub updated_at: DateTimeUtc,
}

/// No relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
