//! Database schema: the migrations embedded from the workspace `migrations/` directory.

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use tracing::info;

use crate::error::StoreError;

/// Every schema migration, embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Primary key of the event log.
pub(crate) const EVENT_ID_CONSTRAINT: &str = "domain_events_pkey";
/// Per-aggregate sequence uniqueness in the event log.
pub(crate) const EVENT_SEQUENCE_CONSTRAINT: &str = "domain_events_aggregate_sequence";

/// Applies pending migrations.
///
/// # Errors
///
/// Returns `StoreError::Migration` if a migration fails or was modified
/// after being applied.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    info!(migrations = MIGRATOR.iter().count(), "database schema up to date");
    Ok(())
}
