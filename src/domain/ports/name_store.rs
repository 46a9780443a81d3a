//! Persistent name tier port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{AvatarId, NameRecord};

/// Durable medium-term store for name records.
///
/// Treated as slower than the volatile tier and eventually consistent: other
/// process replicas may write to it concurrently.
#[async_trait]
pub trait PersistentNameStore: Send + Sync {
    /// Load records cached at or after `cutoff`, or every record when `None`.
    async fn load(&self, cutoff: Option<DateTime<Utc>>) -> DomainResult<Vec<NameRecord>>;

    /// Get the durable copy of one record.
    async fn get(&self, avatar_id: AvatarId) -> DomainResult<Option<NameRecord>>;

    /// Insert or replace the durable copy of a record.
    async fn upsert(&self, record: &NameRecord) -> DomainResult<()>;

    /// Delete records cached before `cutoff`, returning how many were removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;
}
