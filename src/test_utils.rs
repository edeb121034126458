//! Shared test utilities.
//!
//! This module provides common helpers for setting up test databases and
//! settings with sensible defaults.

use crate::{
    config::AppConfig,
    errors::{Error, Result},
};
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tempfile::TempDir;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all store-backed tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates a file-backed `SQLite` database behind a multi-connection pool.
///
/// `sqlite::memory:` serializes everything through one connection, so tests
/// that race writers against each other use this instead. Keep the returned
/// directory alive for as long as the connection is used.
pub async fn setup_file_test_db() -> Result<(TempDir, DatabaseConnection)> {
    let dir = tempfile::tempdir().map_err(|e| Error::Config {
        message: format!("could not create test directory: {e}"),
    })?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("postmeter.db").display());
    let mut options = ConnectOptions::new(url);
    options.max_connections(8).min_connections(2).sqlx_logging(false);

    let db = Database::connect(options).await?;
    crate::config::database::create_tables(&db).await?;
    Ok((dir, db))
}

/// Default settings with provider price ids for the paid tiers.
///
/// # Defaults
/// * free / pro / enterprise credits: 500 / 2500 / 10000
/// * pro price id: `"price_pro"`
/// * enterprise price id: `"price_enterprise"`
/// * monthly quota: 30, max attempts: 3
#[must_use]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.tiers.pro.price_id = Some("price_pro".to_string());
    config.tiers.enterprise.price_id = Some("price_enterprise".to_string());
    config
}

/// Test settings with a custom free-tier allotment (the opening balance).
#[must_use]
pub fn config_with_free_credits(credits: i64) -> AppConfig {
    let mut config = test_config();
    config.tiers.free.monthly_credits = credits;
    config
}

/// A fixed "now": 2030-05-10 12:00:00 UTC.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 5, 10, 12, 0, 0).unwrap()
}
