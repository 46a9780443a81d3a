//! Null persistent tier.
//!
//! Used when the cache runs purely in memory but the type system
//! requires a PersistentNameStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::PersistentNameStore;
use crate::domain::errors::DomainResult;
use crate::domain::models::{AvatarId, NameRecord};

/// A persistent tier that stores nothing.
#[derive(Debug, Clone, Default)]
pub struct NullNameStore;

impl NullNameStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PersistentNameStore for NullNameStore {
    async fn load(&self, _cutoff: Option<DateTime<Utc>>) -> DomainResult<Vec<NameRecord>> {
        Ok(Vec::new())
    }

    async fn get(&self, _avatar_id: AvatarId) -> DomainResult<Option<NameRecord>> {
        Ok(None)
    }

    async fn upsert(&self, _record: &NameRecord) -> DomainResult<()> {
        Ok(())
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> DomainResult<u64> {
        Ok(0)
    }
}
