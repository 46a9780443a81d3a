//! Map-backed persistent tier.
//!
//! Shares records between cache instances in one process, which makes it
//! useful for restart and multi-replica tests. Failures can be injected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AvatarId, NameRecord};
use crate::domain::ports::PersistentNameStore;

#[derive(Clone, Default)]
pub struct InMemoryNameStore {
    records: Arc<RwLock<HashMap<AvatarId, NameRecord>>>,
    unavailable: Arc<AtomicBool>,
    conflicts_remaining: Arc<AtomicU32>,
    upserts: Arc<AtomicUsize>,
}

impl InMemoryNameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `PersistenceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` upserts with a transient write conflict.
    pub fn fail_next_upserts(&self, count: u32) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    /// Successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Write a record directly, bypassing failure injection.
    pub async fn seed(&self, record: NameRecord) {
        self.records.write().await.insert(record.avatar_id, record);
    }

    fn check_available(&self) -> DomainResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::PersistenceUnavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentNameStore for InMemoryNameStore {
    async fn load(&self, cutoff: Option<DateTime<Utc>>) -> DomainResult<Vec<NameRecord>> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| cutoff.map_or(true, |cutoff| r.cached_at >= cutoff))
            .cloned()
            .collect())
    }

    async fn get(&self, avatar_id: AvatarId) -> DomainResult<Option<NameRecord>> {
        self.check_available()?;
        Ok(self.records.read().await.get(&avatar_id).cloned())
    }

    async fn upsert(&self, record: &NameRecord) -> DomainResult<()> {
        self.check_available()?;
        let conflicted = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(DomainError::ConcurrencyConflict {
                entity: "name_record".to_string(),
                id: record.avatar_id.to_string(),
            });
        }

        self.records.write().await.insert(record.avatar_id, record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.cached_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_load_filters_by_cutoff() {
        let store = InMemoryNameStore::new();
        let now = Utc::now();
        let mut old = NameRecord::new(AvatarId::new(), "Old");
        old.cached_at = now - Duration::days(10);
        store.upsert(&old).await.unwrap();
        store.upsert(&NameRecord::new(AvatarId::new(), "New")).await.unwrap();

        assert_eq!(store.load(None).await.unwrap().len(), 2);
        assert_eq!(store.load(Some(now - Duration::days(2))).await.unwrap().len(), 1);
        assert_eq!(store.delete_older_than(now - Duration::days(2)).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryNameStore::new();
        let record = NameRecord::new(AvatarId::new(), "Bob");

        store.fail_next_upserts(1);
        let err = store.upsert(&record).await.unwrap_err();
        assert!(err.is_transient());
        store.upsert(&record).await.unwrap();
        assert_eq!(store.upsert_count(), 1);

        store.set_unavailable(true);
        assert!(matches!(
            store.get(record.avatar_id).await,
            Err(DomainError::PersistenceUnavailable(_))
        ));
    }
}
