//! Synchronization between the volatile store and the persistent tier.
//!
//! The durable tier is shared with other replicas and only eventually
//! consistent, so every flush reconciles against the durable copy under the
//! same acceptance policy the store uses: a newer acceptable durable record is
//! pulled into memory instead of being overwritten.

use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    evaluate_update, AvatarId, CacheConfig, NameRecord, PersistenceConfig, RejectReason, UpdateDecision,
};
use crate::domain::ports::PersistentNameStore;
use crate::services::cache_stats::CacheStats;
use crate::services::name_store::NameRecordStore;

/// What one flush cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records upserted to the durable tier.
    pub written: usize,
    /// Records already up to date in the durable tier.
    pub skipped: usize,
    /// Records replaced in memory by a newer durable copy.
    pub pulled: usize,
    /// Records that could not be written and stay dirty.
    pub failed: usize,
}

pub struct PersistenceSync {
    store: Arc<NameRecordStore>,
    durable: Arc<dyn PersistentNameStore>,
    stats: Arc<CacheStats>,
    cache: CacheConfig,
    config: PersistenceConfig,
    last_purge: Mutex<Option<Instant>>,
}

impl PersistenceSync {
    pub fn new(
        store: Arc<NameRecordStore>,
        durable: Arc<dyn PersistentNameStore>,
        stats: Arc<CacheStats>,
        cache: CacheConfig,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            store,
            durable,
            stats,
            cache,
            config,
            last_purge: Mutex::new(None),
        }
    }

    /// Warm the store with durable records cached within the load window.
    ///
    /// An unavailable durable tier is not fatal; the cache starts empty.
    pub async fn load_initial(&self) -> usize {
        let cutoff = Utc::now() - self.config.load_window();
        match self.durable.load(Some(cutoff)).await {
            Ok(records) => {
                let total = records.len();
                let installed = records
                    .into_iter()
                    .filter(|r| self.store.install(r.clone()).is_accepted())
                    .count();
                info!(loaded = total, installed, "warmed name cache from persistent tier");
                installed
            }
            Err(e) => {
                warn!(error = %e, "persistent tier unavailable at startup, starting empty");
                0
            }
        }
    }

    /// Fetch one record from the durable tier into the store.
    pub async fn fetch(&self, avatar_id: AvatarId) -> DomainResult<Option<NameRecord>> {
        let Some(record) = self.durable.get(avatar_id).await? else {
            return Ok(None);
        };
        if !record.has_valid_display_name() {
            return Ok(None);
        }
        self.stats.record_durable_hit();
        self.store.install(record);
        Ok(self.store.get(avatar_id))
    }

    /// Write every dirty record to the durable tier.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let records = self.store.take_dirty();
        let mut unreconciled = Unreconciled::new(&self.store, &records);

        for record in records {
            let avatar_id = record.avatar_id;
            match self.reconcile(record).await {
                Ok(Reconciled::Written) => report.written += 1,
                Ok(Reconciled::Skipped) => report.skipped += 1,
                Ok(Reconciled::Pulled) => report.pulled += 1,
                Err(DomainError::PersistenceUnavailable(reason)) => {
                    // The guard re-marks this record and everything after it.
                    report.failed += unreconciled.remaining();
                    self.stats.record_flush_failure();
                    warn!(reason = %reason, deferred = report.failed, "persistent tier unavailable, flush deferred");
                    break;
                }
                Err(e) => {
                    self.store.mark_dirty(avatar_id);
                    report.failed += 1;
                    self.stats.record_flush_failure();
                    warn!(avatar_id = %avatar_id, error = %e, "failed to persist name record");
                }
            }
            unreconciled.advance();
        }
        drop(unreconciled);

        if report.written > 0 {
            self.stats.record_flushed(report.written as u64);
        }
        if report != FlushReport::default() {
            debug!(
                written = report.written,
                skipped = report.skipped,
                pulled = report.pulled,
                failed = report.failed,
                "flush complete"
            );
        }
        report
    }

    /// Flush, giving up after `limit`. Returns `None` on timeout.
    pub async fn flush_with_timeout(&self, limit: Duration) -> Option<FlushReport> {
        if let Ok(report) = tokio::time::timeout(limit, self.flush()).await {
            Some(report)
        } else {
            warn!(
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                remaining = self.store.dirty_count(),
                "flush timed out"
            );
            None
        }
    }

    async fn reconcile(&self, record: NameRecord) -> DomainResult<Reconciled> {
        let Some(durable) = self.durable.get(record.avatar_id).await? else {
            self.write(&record).await?;
            return Ok(Reconciled::Written);
        };

        let durable_wins = evaluate_update(Some(&record), &durable).is_accept();
        if durable.last_updated > record.last_updated && durable_wins {
            return Ok(self.pull(durable));
        }

        match evaluate_update(Some(&durable), &record) {
            UpdateDecision::Accept => {
                self.write(&record).await?;
                Ok(Reconciled::Written)
            }
            UpdateDecision::Reject(RejectReason::Unchanged) => {
                let mut merged = record;
                merged.fill_missing_identity(&durable);
                merged.cached_at = merged.cached_at.max(durable.cached_at);
                merged.next_scheduled_refresh = merged.next_scheduled_refresh.max(durable.next_scheduled_refresh);
                if merged == durable {
                    Ok(Reconciled::Skipped)
                } else {
                    self.write(&merged).await?;
                    Ok(Reconciled::Written)
                }
            }
            UpdateDecision::Reject(_) if durable_wins => Ok(self.pull(durable)),
            UpdateDecision::Reject(_) => Ok(Reconciled::Skipped),
        }
    }

    /// Install the durable copy unless memory moved past it meanwhile; a newer
    /// in-memory record is dirty and goes out on the next flush.
    fn pull(&self, durable: NameRecord) -> Reconciled {
        if self.store.install(durable).is_accepted() {
            Reconciled::Pulled
        } else {
            Reconciled::Skipped
        }
    }

    /// Upsert, retrying transient write conflicts with exponential backoff.
    async fn write(&self, record: &NameRecord) -> DomainResult<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.upsert_retry_initial())
            .with_max_elapsed_time(Some(self.config.upsert_retry_max_elapsed()))
            .build();

        backoff::future::retry(policy, || async {
            self.durable.upsert(record).await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    /// Evict volatile records past their age or beyond the size cap.
    pub fn evict(&self) -> usize {
        self.store
            .evict(self.cache.max_age(), self.cache.max_entries, Utc::now())
    }

    /// Delete long-unseen durable records once per purge interval.
    pub async fn maybe_purge(&self) -> DomainResult<u64> {
        let Some(purge_after) = self.config.purge_after() else {
            return Ok(0);
        };

        {
            let mut last = self.last_purge.lock().await;
            let now = Instant::now();
            if last.is_some_and(|at| now.saturating_duration_since(at) < self.config.purge_interval()) {
                return Ok(0);
            }
            *last = Some(now);
        }

        let purged = self.durable.delete_older_than(Utc::now() - purge_after).await?;
        if purged > 0 {
            info!(purged, "purged stale records from persistent tier");
        }
        Ok(purged)
    }

    /// Periodic flush, eviction and purge until cancelled.
    ///
    /// The final flush on shutdown is left to the owner.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(flush_interval_secs = self.config.flush_interval_secs, "persistence sync started");

        let mut timer = interval(self.config.flush_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.flush().await;
                    self.evict();
                    if let Err(e) = self.maybe_purge().await {
                        warn!(error = %e, "durable purge failed");
                    }
                }
            }
        }

        info!(dirty = self.store.dirty_count(), "persistence sync stopped");
    }
}

enum Reconciled {
    Written,
    Skipped,
    Pulled,
}

/// Drained dirty ids not yet reconciled. Dropping it, including when a
/// timed-out flush is cancelled, puts them back in the dirty set.
struct Unreconciled<'a> {
    store: &'a NameRecordStore,
    ids: Vec<AvatarId>,
    next: usize,
}

impl<'a> Unreconciled<'a> {
    fn new(store: &'a NameRecordStore, records: &[NameRecord]) -> Self {
        Self {
            store,
            ids: records.iter().map(|r| r.avatar_id).collect(),
            next: 0,
        }
    }

    fn advance(&mut self) {
        self.next += 1;
    }

    fn remaining(&self) -> usize {
        self.ids.len().saturating_sub(self.next)
    }
}

impl Drop for Unreconciled<'_> {
    fn drop(&mut self) {
        for id in self.ids.iter().skip(self.next) {
            self.store.mark_dirty(*id);
        }
    }
}
