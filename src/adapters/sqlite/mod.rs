//! SQLite persistent tier.
//!
//! One table, `name_records`, keyed by avatar id. Timestamps are stored as
//! fixed-width RFC3339 text so range predicates compare correctly.

pub mod connection;
pub mod migrations;
pub mod name_record_repository;

pub use connection::{create_pool, create_test_pool, verify_connection, ConnectionError, PoolConfig};
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use name_record_repository::SqliteNameStore;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AvatarId, DatabaseConfig};

fn parse_avatar_id(column: &str, value: &str) -> DomainResult<AvatarId> {
    value
        .parse()
        .map_err(|e| DomainError::SerializationError(format!("{column}: {e}")))
}

fn parse_timestamp(column: &str, value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::SerializationError(format!("{column}: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),
}

async fn migrate(pool: SqlitePool) -> Result<SqlitePool, DatabaseError> {
    let applied = Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    if applied > 0 {
        info!(applied, "applied name cache migrations");
    }
    Ok(pool)
}

/// Open a pool on `database_url` and bring the schema up to date.
pub async fn initialize_database(database_url: &str, config: Option<PoolConfig>) -> Result<SqlitePool, DatabaseError> {
    migrate(create_pool(database_url, config).await?).await
}

/// Open (creating if needed) the configured database and wrap it as a name store.
pub async fn open_name_store(config: &DatabaseConfig) -> Result<SqliteNameStore, DatabaseError> {
    let pool = initialize_database(&config.url(), Some(PoolConfig::from(config))).await?;
    verify_connection(&pool).await?;
    Ok(SqliteNameStore::new(pool))
}

/// In-memory pool with the schema applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    migrate(create_test_pool().await?).await
}
