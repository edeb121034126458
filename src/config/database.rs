//! Database configuration module.
//!
//! This module handles the database connection (`SQLite` by default, Postgres when
//! `DATABASE_URL` points at one) and table creation using `SeaORM`. Tables are
//! generated from the entity definitions with `Schema::create_table_from_entity`,
//! so the schema always matches the Rust structs without hand-written SQL.

use crate::entities::{
    CheckoutSession, CreditAccount, CreditTransaction, ProcessedEvent, ScheduledTask,
    SubscriptionState, TaskQuotaGuard,
};
use crate::errors::Result;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/postmeter.sqlite?mode=rwc";

/// Gets the database URL from the environment, falling back to a local `SQLite` file.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection using `DATABASE_URL` (or the default `SQLite` file).
pub async fn create_connection() -> Result<DatabaseConnection> {
    let database_url = get_database_url();
    info!(backend = %database_url.split(':').next().unwrap_or("unknown"), "Connecting to database");
    Database::connect(&database_url).await.map_err(Into::into)
}

/// Creates every table that does not exist yet.
///
/// Accounts are created before ledger rows because `credit_transactions`
/// references `credit_accounts`.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    create_table(db, CreditAccount).await?;
    create_table(db, CreditTransaction).await?;
    create_table(db, SubscriptionState).await?;
    create_table(db, ProcessedEvent).await?;
    create_table(db, CheckoutSession).await?;
    create_table(db, ScheduledTask).await?;
    create_table(db, TaskQuotaGuard).await?;
    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(builder.build(&statement)).await?;
    Ok(())
}
