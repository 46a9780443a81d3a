//! SQLite implementation of the persistent name tier.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AvatarId, NameRecord};
use crate::domain::ports::PersistentNameStore;

use super::{parse_avatar_id, parse_timestamp};

#[derive(Clone)]
pub struct SqliteNameStore {
    pool: SqlitePool,
}

impl SqliteNameStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM name_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Fixed-width UTC timestamps keep string comparison in time order.
fn encode_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl PersistentNameStore for SqliteNameStore {
    async fn load(&self, cutoff: Option<DateTime<Utc>>) -> DomainResult<Vec<NameRecord>> {
        let rows: Vec<NameRecordRow> = match cutoff {
            Some(cutoff) => {
                sqlx::query_as("SELECT * FROM name_records WHERE cached_at >= ? ORDER BY cached_at DESC")
                    .bind(encode_time(cutoff))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM name_records ORDER BY cached_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        // One unreadable row must not cost the whole warm start.
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let avatar_id = row.avatar_id.clone();
                NameRecord::try_from(row)
                    .inspect_err(|e| warn!(avatar_id = %avatar_id, error = %e, "skipping unreadable name record"))
                    .ok()
            })
            .collect())
    }

    async fn get(&self, avatar_id: AvatarId) -> DomainResult<Option<NameRecord>> {
        let row: Option<NameRecordRow> = sqlx::query_as("SELECT * FROM name_records WHERE avatar_id = ?")
            .bind(avatar_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, record: &NameRecord) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO name_records (avatar_id, display_name, user_name, legacy_first_name,
               legacy_last_name, is_default_display_name, last_updated, cached_at, next_scheduled_refresh)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(avatar_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   user_name = excluded.user_name,
                   legacy_first_name = excluded.legacy_first_name,
                   legacy_last_name = excluded.legacy_last_name,
                   is_default_display_name = excluded.is_default_display_name,
                   last_updated = excluded.last_updated,
                   cached_at = excluded.cached_at,
                   next_scheduled_refresh = excluded.next_scheduled_refresh"#,
        )
        .bind(record.avatar_id.to_string())
        .bind(&record.display_name)
        .bind(&record.user_name)
        .bind(&record.legacy_first_name)
        .bind(&record.legacy_last_name)
        .bind(record.is_default_display_name)
        .bind(encode_time(record.last_updated))
        .bind(encode_time(record.cached_at))
        .bind(encode_time(record.next_scheduled_refresh))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM name_records WHERE cached_at < ?")
            .bind(encode_time(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct NameRecordRow {
    avatar_id: String,
    display_name: String,
    user_name: String,
    legacy_first_name: String,
    legacy_last_name: String,
    is_default_display_name: bool,
    last_updated: String,
    cached_at: String,
    next_scheduled_refresh: String,
}

impl TryFrom<NameRecordRow> for NameRecord {
    type Error = DomainError;

    fn try_from(row: NameRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            avatar_id: parse_avatar_id("avatar_id", &row.avatar_id)?,
            display_name: row.display_name,
            user_name: row.user_name,
            legacy_first_name: row.legacy_first_name,
            legacy_last_name: row.legacy_last_name,
            is_default_display_name: row.is_default_display_name,
            last_updated: parse_timestamp("last_updated", &row.last_updated)?,
            cached_at: parse_timestamp("cached_at", &row.cached_at)?,
            next_scheduled_refresh: parse_timestamp("next_scheduled_refresh", &row.next_scheduled_refresh)?,
        })
    }
}
