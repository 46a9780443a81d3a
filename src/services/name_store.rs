//! Volatile name tier.
//!
//! Holds the authoritative in-memory record per avatar id and arbitrates every
//! write through [`evaluate_update`]. Writes for one id are serialized by the
//! map's per-shard lock; writes for unrelated ids proceed in parallel.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::models::{evaluate_update, AvatarId, NameRecord, RejectReason, UpdateDecision};
use crate::services::cache_stats::CacheStats;
use crate::services::name_events::NameChangeBus;

/// Where a candidate record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// A fresh upstream answer. Stamped now, persisted and announced.
    Lookup,
    /// A copy read back from the persistent tier. Keeps its own timestamps and
    /// is not re-persisted; announced only when it replaces a cached name.
    Durable,
}

/// Result of applying a candidate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted { previous: Option<String> },
    Rejected(RejectReason),
}

impl ApplyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// In-memory record map with the acceptance policy and dirty tracking.
pub struct NameRecordStore {
    records: DashMap<AvatarId, NameRecord>,
    dirty: DashSet<AvatarId>,
    events: Arc<NameChangeBus>,
    stats: Arc<CacheStats>,
    refresh_after: Duration,
}

/// A durable copy must not replace a valid record that is at least as recent,
/// unless it brings back a custom name over a default one.
fn is_outdated(existing: &NameRecord, candidate: &NameRecord) -> bool {
    let restores_custom = existing.is_default_display_name && !candidate.is_default_display_name;
    existing.has_valid_display_name() && !restores_custom && existing.last_updated >= candidate.last_updated
}

impl NameRecordStore {
    pub fn new(events: Arc<NameChangeBus>, stats: Arc<CacheStats>, refresh_after: Duration) -> Self {
        Self {
            records: DashMap::new(),
            dirty: DashSet::new(),
            events,
            stats,
            refresh_after,
        }
    }

    pub fn get(&self, avatar_id: AvatarId) -> Option<NameRecord> {
        self.records.get(&avatar_id).map(|r| r.value().clone())
    }

    /// True when a record with a usable display name is cached.
    pub fn has_valid(&self, avatar_id: AvatarId) -> bool {
        self.records
            .get(&avatar_id)
            .is_some_and(|r| r.has_valid_display_name())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn refresh_after(&self) -> Duration {
        self.refresh_after
    }

    /// Apply a fresh upstream answer.
    pub fn apply(&self, candidate: NameRecord) -> ApplyOutcome {
        self.apply_from(candidate, RecordSource::Lookup)
    }

    /// Install a record read from the persistent tier.
    pub fn install(&self, candidate: NameRecord) -> ApplyOutcome {
        self.apply_from(candidate, RecordSource::Durable)
    }

    pub fn apply_from(&self, candidate: NameRecord, source: RecordSource) -> ApplyOutcome {
        let now = Utc::now();
        let avatar_id = candidate.avatar_id;
        let mut announce: Option<(NameRecord, Option<String>)> = None;

        let outcome = match self.records.entry(avatar_id) {
            Entry::Vacant(vacant) => {
                let record = self.stamp(candidate, source, now);
                if source == RecordSource::Lookup {
                    announce = Some((record.clone(), None));
                    // Marked while the entry guard is held so eviction cannot slip in between.
                    self.dirty.insert(avatar_id);
                }
                vacant.insert(record);
                ApplyOutcome::Accepted { previous: None }
            }
            Entry::Occupied(mut occupied) => {
                let decision = if source == RecordSource::Durable && is_outdated(occupied.get(), &candidate) {
                    UpdateDecision::Reject(RejectReason::Outdated)
                } else {
                    evaluate_update(Some(occupied.get()), &candidate)
                };
                match decision {
                    UpdateDecision::Accept => {
                        let previous = occupied
                            .get()
                            .has_valid_display_name()
                            .then(|| occupied.get().display_name.clone());
                        let mut record = self.stamp(candidate, source, now);
                        record.fill_missing_identity(occupied.get());
                        announce = Some((record.clone(), previous.clone()));
                        if source == RecordSource::Lookup {
                            self.dirty.insert(avatar_id);
                        }
                        occupied.insert(record);
                        ApplyOutcome::Accepted { previous }
                    }
                    UpdateDecision::Reject(reason) => {
                        let existing = occupied.get_mut();
                        let filled = reason == RejectReason::Unchanged && existing.fill_missing_identity(&candidate);
                        let touched = source == RecordSource::Lookup && reason.confirms_lookup();
                        if touched {
                            existing.touch(now, self.refresh_after);
                        }
                        if filled || touched {
                            self.dirty.insert(avatar_id);
                        }
                        ApplyOutcome::Rejected(reason)
                    }
                }
            }
        };

        match &outcome {
            ApplyOutcome::Accepted { .. } => self.stats.record_accepted(),
            ApplyOutcome::Rejected(reason) => {
                self.stats.record_rejected();
                trace!(avatar_id = %avatar_id, reason = reason.as_str(), "name update rejected");
            }
        }

        // Published after the entry guard is released.
        if let Some((record, previous)) = announce {
            debug!(avatar_id = %avatar_id, display_name = %record.display_name, "display name changed");
            self.events.publish(&record, previous);
        }

        outcome
    }

    fn stamp(&self, mut record: NameRecord, source: RecordSource, now: DateTime<Utc>) -> NameRecord {
        if source == RecordSource::Lookup {
            record.last_updated = now;
            record.touch(now, self.refresh_after);
        }
        record
    }

    pub fn mark_dirty(&self, avatar_id: AvatarId) {
        if self.records.contains_key(&avatar_id) {
            self.dirty.insert(avatar_id);
        }
    }

    /// Drain the dirty set, returning the current copy of each dirty record.
    pub fn take_dirty(&self) -> Vec<NameRecord> {
        let ids: Vec<AvatarId> = self.dirty.iter().map(|id| *id).collect();
        ids.into_iter()
            .filter_map(|id| {
                self.dirty.remove(&id);
                self.get(id)
            })
            .collect()
    }

    /// Evict non-dirty records older than `max_age`, then the oldest non-dirty
    /// records beyond `max_entries`. Returns the number evicted.
    pub fn evict(&self, max_age: Duration, max_entries: usize, now: DateTime<Utc>) -> usize {
        let mut evicted = 0usize;
        self.records.retain(|id, record| {
            let keep = self.dirty.contains(id) || !record.is_older_than(max_age, now);
            if !keep {
                evicted += 1;
            }
            keep
        });

        let len = self.records.len();
        if len > max_entries {
            let mut candidates: Vec<(AvatarId, DateTime<Utc>)> = self
                .records
                .iter()
                .filter(|r| !self.dirty.contains(r.key()))
                .map(|r| (*r.key(), r.cached_at))
                .collect();
            candidates.sort_by_key(|(_, cached_at)| *cached_at);

            for (id, _) in candidates.into_iter().take(len - max_entries) {
                if self
                    .records
                    .remove_if(&id, |id, _| !self.dirty.contains(id))
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.stats.record_evicted(evicted as u64);
            debug!(evicted, remaining = self.records.len(), "evicted records from volatile tier");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (NameRecordStore, Arc<NameChangeBus>) {
        let events = Arc::new(NameChangeBus::new(64));
        let store = NameRecordStore::new(events.clone(), Arc::new(CacheStats::new()), Duration::hours(2));
        (store, events)
    }

    #[test]
    fn test_first_write_accepted_and_announced() {
        let (store, events) = store();
        let id = AvatarId::new();
        let outcome = store.apply(NameRecord::new(id, "Bob"));

        assert_eq!(outcome, ApplyOutcome::Accepted { previous: None });
        assert_eq!(store.get(id).unwrap().display_name, "Bob");
        assert_eq!(events.published(), 1);
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn test_custom_name_survives_default_update() {
        let (store, events) = store();
        let id = AvatarId::new();
        store.apply(NameRecord::new(id, "Jara"));

        let outcome = store.apply(
            NameRecord::new(id, "Jara Lowell")
                .with_legacy_name("Jara", "Lowell")
                .as_default_display_name(),
        );

        assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::CustomToDefault));
        assert_eq!(store.get(id).unwrap().display_name, "Jara");
        assert_eq!(events.published(), 1);
    }

    #[test]
    fn test_repeat_apply_is_idempotent() {
        let (store, events) = store();
        let id = AvatarId::new();
        let record = NameRecord::new(id, "Bob").with_user_name("bob");

        store.apply(record.clone());
        let first = store.get(id).unwrap();
        let outcome = store.apply(record);
        let second = store.get(id).unwrap();

        assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::Unchanged));
        assert_eq!(first.display_name, second.display_name);
        assert_eq!(first.user_name, second.user_name);
        assert_eq!(first.last_updated, second.last_updated);
        assert_eq!(events.published(), 1);
    }

    #[test]
    fn test_unchanged_fills_identity_without_announcing() {
        let (store, events) = store();
        let id = AvatarId::new();
        store.apply(NameRecord::new(id, "Bob"));
        store.take_dirty();

        store.apply(NameRecord::new(id, "Bob").with_legacy_name("Bob", "Resident"));

        let record = store.get(id).unwrap();
        assert_eq!(record.legacy_first_name, "Bob");
        assert_eq!(events.published(), 1);
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn test_invalid_candidate_leaves_record_untouched() {
        let (store, _) = store();
        let id = AvatarId::new();
        store.apply(NameRecord::new(id, "Bob"));
        store.take_dirty();
        let before = store.get(id).unwrap();

        let outcome = store.apply(NameRecord::new(id, "???"));

        assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::InvalidCandidate));
        assert_eq!(store.get(id).unwrap(), before);
        assert_eq!(store.dirty_count(), 0);
    }

    #[test]
    fn test_durable_install_is_silent_and_clean() {
        let (store, events) = store();
        let id = AvatarId::new();
        let mut record = NameRecord::new(id, "Bob");
        record.cached_at = Utc::now() - Duration::hours(10);
        let cached_at = record.cached_at;

        assert!(store.install(record).is_accepted());
        assert_eq!(events.published(), 0);
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(store.get(id).unwrap().cached_at, cached_at);
    }

    #[test]
    fn test_durable_install_does_not_replace_newer_record() {
        let (store, events) = store();
        let id = AvatarId::new();
        store.apply(NameRecord::new(id, "Roberto"));
        let mut durable = NameRecord::new(id, "Robert");
        durable.last_updated = Utc::now() - Duration::minutes(1);

        let outcome = store.install(durable);

        assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::Outdated));
        assert_eq!(store.get(id).unwrap().display_name, "Roberto");
        assert_eq!(events.published(), 1);
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn test_newer_durable_copy_replaces_record() {
        let (store, _) = store();
        let id = AvatarId::new();
        let mut cached = NameRecord::new(id, "Robert");
        cached.last_updated = Utc::now() - Duration::hours(1);
        store.install(cached);

        assert!(store.install(NameRecord::new(id, "Roberto")).is_accepted());
        assert_eq!(store.get(id).unwrap().display_name, "Roberto");
    }

    #[test]
    fn test_accepted_lookup_survives_size_eviction() {
        let (store, _) = store();
        let id = AvatarId::new();
        store.apply(NameRecord::new(id, "Bob"));

        assert_eq!(store.evict(Duration::hours(48), 0, Utc::now()), 0);
        let dirty = store.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].avatar_id, id);
    }

    #[test]
    fn test_take_dirty_drains() {
        let (store, _) = store();
        store.apply(NameRecord::new(AvatarId::new(), "A"));
        store.apply(NameRecord::new(AvatarId::new(), "B"));

        assert_eq!(store.take_dirty().len(), 2);
        assert!(store.take_dirty().is_empty());
    }

    #[test]
    fn test_evict_by_age_skips_dirty() {
        let (store, _) = store();
        let now = Utc::now();
        let old_clean = AvatarId::new();
        let old_dirty = AvatarId::new();

        let mut record = NameRecord::new(old_clean, "Old");
        record.cached_at = now - Duration::hours(72);
        store.install(record);

        store.apply(NameRecord::new(old_dirty, "Dirty"));
        let evicted = store.evict(Duration::hours(48), 100, now + Duration::hours(72));

        assert_eq!(evicted, 1);
        assert!(store.get(old_clean).is_none());
        assert!(store.get(old_dirty).is_some());
    }

    #[test]
    fn test_evict_by_size_removes_oldest() {
        let (store, _) = store();
        let now = Utc::now();
        let ids: Vec<AvatarId> = (0..5).map(|_| AvatarId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            let mut record = NameRecord::new(*id, format!("Name {i}"));
            record.cached_at = now - Duration::minutes(10 - i as i64);
            store.install(record);
        }

        let evicted = store.evict(Duration::hours(48), 3, now);

        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 3);
        assert!(store.get(ids[0]).is_none());
        assert!(store.get(ids[1]).is_none());
        assert!(store.get(ids[4]).is_some());
    }

    #[test]
    fn test_concurrent_writers_for_one_id() {
        let (store, events) = store();
        let store = Arc::new(store);
        let id = AvatarId::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.apply(NameRecord::new(id, format!("Name {}", (i * 50 + j) % 3)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = store.get(id).unwrap();
        assert!(record.display_name.starts_with("Name "));
        assert_eq!(store.len(), 1);
        assert!(events.published() >= 1);
    }
}
