//! Task quota guard entity - One row per owner serialising quota admission.
//!
//! Scheduling and edits bump `revision` before counting, so two admissions
//! for the same owner cannot both observe the same count. Only the scheduler
//! (`core::schedule`) writes to this table.

use sea_orm::entity::prelude::*;

/// Task quota guard database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "task_quota_guards")]
pub struct Model {
    /// External owner identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: String,
    /// Bumped on every admission attempt
    pub revision: i64,
    /// When the guard was last taken
    pub updated_at: DateTimeUtc,
}

/// No relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
