//! Public entry point of the name cache.
//!
//! One [`NameCache`] per process, handed by reference to consumers. Reads never
//! fail: a miss degrades to a placeholder and schedules a lookup, a stale hit
//! returns the cached value and schedules a refresh.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapters::sqlite::{open_name_store, DatabaseError};
use crate::domain::models::{AvatarId, Config, LookupResult, NameDisplayMode, NameRecord, SessionId};
use crate::domain::ports::{LookupConnection, NullNameStore, PersistentNameStore};
use crate::services::cache_stats::{CacheStats, CacheStatsSnapshot};
use crate::services::connection_pool::ConnectionPool;
use crate::services::lookup_dispatcher::LookupDispatcher;
use crate::services::name_events::{DisplayNameChanged, NameChangeBus};
use crate::services::name_store::NameRecordStore;
use crate::services::persistence_sync::{FlushReport, PersistenceSync};
use crate::services::refresh_daemon::{RefreshDaemon, RefreshHandle, RefreshStatus};
use crate::services::request_queue::{EnqueueOutcome, RequestQueue, RequestWorker};
use crate::services::retry_queue::{RetryQueue, RetryWorker};

/// Upper bound on a read-through to the persistent tier from an async read.
const READ_THROUGH_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of [`NameCache::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether workers and in-flight batches finished within the grace period.
    pub drained: bool,
    /// The final flush, or `None` if it timed out.
    pub flush: Option<FlushReport>,
}

pub struct NameCache {
    config: Config,
    stats: Arc<CacheStats>,
    events: Arc<NameChangeBus>,
    store: Arc<NameRecordStore>,
    pool: Arc<ConnectionPool>,
    requests: Arc<RequestQueue>,
    retries: Arc<RetryQueue>,
    dispatcher: Arc<LookupDispatcher>,
    persistence: Arc<PersistenceSync>,
    request_receiver: Mutex<Option<mpsc::UnboundedReceiver<AvatarId>>>,
    refresh_handle: Mutex<Option<RefreshHandle>>,
    cancel: CancellationToken,
    workers: TaskTracker,
    batches: TaskTracker,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl NameCache {
    /// Build a cache over the given persistent tier. Workers start with [`start`](Self::start).
    pub fn new(config: Config, durable: Arc<dyn PersistentNameStore>) -> Self {
        let stats = Arc::new(CacheStats::new());
        let events = Arc::new(NameChangeBus::new(config.cache.notification_capacity));
        let store = Arc::new(NameRecordStore::new(
            events.clone(),
            stats.clone(),
            config.cache.refresh_after(),
        ));
        let pool = Arc::new(ConnectionPool::new());
        let retries = Arc::new(RetryQueue::new(config.retry.clone(), stats.clone()));
        let (requests, receiver) = RequestQueue::new(retries.clone(), config.requests.pending_timeout());
        let requests = Arc::new(requests);
        let dispatcher = Arc::new(LookupDispatcher::new(
            pool.clone(),
            store.clone(),
            requests.clone(),
            retries.clone(),
            stats.clone(),
            config.requests.max_concurrent_lookups,
            config.requests.lookup_timeout(),
            &config.rate_limit,
        ));
        let persistence = Arc::new(PersistenceSync::new(
            store.clone(),
            durable,
            stats.clone(),
            config.cache.clone(),
            config.persistence.clone(),
        ));

        Self {
            config,
            stats,
            events,
            store,
            pool,
            requests,
            retries,
            dispatcher,
            persistence,
            request_receiver: Mutex::new(Some(receiver)),
            refresh_handle: Mutex::new(None),
            cancel: CancellationToken::new(),
            workers: TaskTracker::new(),
            batches: TaskTracker::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// A cache without a persistent tier.
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Arc::new(NullNameStore::new()))
    }

    /// A cache backed by the configured SQLite database.
    pub async fn with_sqlite(config: Config) -> Result<Self, DatabaseError> {
        let durable = open_name_store(&config.database).await?;
        Ok(Self::new(config, Arc::new(durable)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Warm from the persistent tier and spawn the pipeline workers.
    ///
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let loaded = self.persistence.load_initial().await;

        if let Some(receiver) = self.request_receiver.lock().await.take() {
            let worker = RequestWorker::new(
                self.requests.clone(),
                receiver,
                self.dispatcher.clone(),
                self.config.requests.clone(),
                self.cancel.clone(),
                self.batches.clone(),
            );
            self.workers.spawn(worker.run());
        }

        let retry_worker = RetryWorker::new(
            self.retries.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.config.requests.batch_size,
            self.cancel.clone(),
            self.batches.clone(),
        );
        self.workers.spawn(retry_worker.run());

        if self.config.refresh.enabled {
            let daemon = RefreshDaemon::new(
                self.pool.clone(),
                self.store.clone(),
                self.requests.clone(),
                self.config.refresh.clone(),
            );
            *self.refresh_handle.lock().await = Some(daemon.handle());
            self.workers.spawn(daemon.run(self.cancel.clone()));
        }

        self.workers.spawn(self.persistence.clone().run(self.cancel.clone()));

        info!(loaded, refresh = self.config.refresh.enabled, "name cache started");
    }

    /// Stop intake, let in-flight work finish within the grace period, then
    /// flush dirty records with a bounded wait.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        info!("name cache shutting down");

        self.requests.close();
        self.retries.close();
        self.cancel.cancel();
        self.workers.close();
        self.batches.close();

        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            self.workers.wait().await;
            self.batches.wait().await;
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                grace_ms = self.config.shutdown_grace_ms,
                "in-flight lookups did not finish within the grace period"
            );
        }

        let flush = self
            .persistence
            .flush_with_timeout(self.config.persistence.shutdown_flush_timeout())
            .await;

        info!(drained, flushed = flush.map_or(0, |f| f.written), "name cache stopped");
        ShutdownReport { drained, flush }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Cached record, memory only.
    pub fn get_record(&self, avatar_id: AvatarId) -> Option<NameRecord> {
        self.store.get(avatar_id)
    }

    /// Formatted name from memory, or `fallback` (or the loading placeholder) on a miss.
    ///
    /// Never waits. A miss queues a lookup, a stale hit queues a refresh.
    pub fn get_display_name(&self, avatar_id: AvatarId, mode: NameDisplayMode, fallback: Option<&str>) -> String {
        let placeholder = || {
            fallback
                .map(str::to_string)
                .unwrap_or_else(|| self.config.cache.loading_placeholder.clone())
        };

        match self.cached(avatar_id) {
            Some(record) => mode.format(&record).unwrap_or_else(placeholder),
            None => {
                self.request_lookup(avatar_id);
                placeholder()
            }
        }
    }

    /// Formatted name, consulting the persistent tier on a memory miss.
    pub async fn get_display_name_async(&self, avatar_id: AvatarId, mode: NameDisplayMode) -> String {
        self.resolve(avatar_id)
            .await
            .and_then(|record| mode.format(&record))
            .unwrap_or_else(|| self.config.cache.loading_placeholder.clone())
    }

    /// Legacy "First Last" name, falling back to the display name.
    pub async fn get_legacy_name_async(&self, avatar_id: AvatarId) -> String {
        self.get_display_name_async(avatar_id, NameDisplayMode::LegacyOnly).await
    }

    /// Account user name, derived from the legacy name when not supplied.
    pub async fn get_user_name_async(&self, avatar_id: AvatarId) -> String {
        self.resolve(avatar_id)
            .await
            .and_then(|record| record.effective_user_name())
            .unwrap_or_else(|| self.config.cache.loading_placeholder.clone())
    }

    /// Make sure every id is cached or on its way. Returns how many lookups were queued.
    pub async fn preload_async(&self, avatar_ids: &[AvatarId]) -> usize {
        let mut seen = HashSet::with_capacity(avatar_ids.len());
        let mut queued = 0;

        for &avatar_id in avatar_ids {
            if avatar_id.is_nil() || !seen.insert(avatar_id) || self.store.has_valid(avatar_id) {
                continue;
            }
            if self.read_through(avatar_id).await.is_some() {
                continue;
            }
            if self.request_lookup(avatar_id) {
                queued += 1;
            }
        }

        debug!(requested = avatar_ids.len(), queued, "preload");
        queued
    }

    /// Apply results obtained outside the request pipeline, e.g. pushed by a session.
    ///
    /// Returns how many were accepted.
    pub fn update_from_lookup(&self, results: Vec<LookupResult>) -> usize {
        let now = Utc::now();
        let refresh_after = self.store.refresh_after();
        let mut accepted = 0;

        for result in results {
            let avatar_id = result.avatar_id;
            if avatar_id.is_nil() || !result.is_confirmed() {
                continue;
            }
            if self.store.apply(result.into_record(now, refresh_after)).is_accepted() {
                accepted += 1;
            }
            // A queued request keeps its pending marker until its own batch
            // completes, so the id cannot be queued a second time meanwhile.
            self.retries.clear(avatar_id);
        }
        accepted
    }

    pub fn register_connection(&self, session_id: SessionId, connection: Arc<dyn LookupConnection>) {
        self.pool.register(session_id, connection);
    }

    pub fn unregister_connection(&self, session_id: SessionId) -> bool {
        self.pool.unregister(session_id)
    }

    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Follow accepted display-name changes.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplayNameChanged> {
        self.events.subscribe()
    }

    /// Queue a lookup for an id. Returns true if it was newly queued.
    pub fn request_lookup(&self, avatar_id: AvatarId) -> bool {
        if avatar_id.is_nil() {
            return false;
        }
        let outcome = self.requests.enqueue(avatar_id);
        if outcome == EnqueueOutcome::Closed && !self.stopped.load(Ordering::Acquire) {
            warn!(avatar_id = %avatar_id, "request pipeline closed unexpectedly");
        }
        outcome.is_queued()
    }

    pub fn is_pending(&self, avatar_id: AvatarId) -> bool {
        self.requests.is_pending(avatar_id)
    }

    pub fn is_retrying(&self, avatar_id: AvatarId) -> bool {
        self.retries.is_tracked(avatar_id)
    }

    pub fn pending_count(&self) -> usize {
        self.requests.pending_count()
    }

    pub fn retry_count(&self) -> usize {
        self.retries.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush dirty records now instead of waiting for the next cycle.
    pub async fn flush(&self) -> FlushReport {
        self.persistence.flush().await
    }

    pub async fn refresh_status(&self) -> Option<RefreshStatus> {
        let handle = self.refresh_handle.lock().await.clone()?;
        Some(handle.status().await)
    }

    /// Valid cached record, counting the hit and queuing a refresh when stale.
    fn cached(&self, avatar_id: AvatarId) -> Option<NameRecord> {
        if avatar_id.is_nil() {
            return None;
        }
        let Some(record) = self.store.get(avatar_id).filter(NameRecord::has_valid_display_name) else {
            self.stats.record_miss();
            return None;
        };

        self.stats.record_hit();
        if record.is_refresh_due(Utc::now()) {
            self.stats.record_stale_hit();
            self.request_lookup(avatar_id);
        }
        Some(record)
    }

    async fn resolve(&self, avatar_id: AvatarId) -> Option<NameRecord> {
        if avatar_id.is_nil() {
            return None;
        }
        if let Some(record) = self.cached(avatar_id) {
            return Some(record);
        }
        if let Some(record) = self.read_through(avatar_id).await {
            if record.is_refresh_due(Utc::now()) {
                self.request_lookup(avatar_id);
            }
            return Some(record);
        }
        self.request_lookup(avatar_id);
        None
    }

    async fn read_through(&self, avatar_id: AvatarId) -> Option<NameRecord> {
        match tokio::time::timeout(READ_THROUGH_TIMEOUT, self.persistence.fetch(avatar_id)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                debug!(avatar_id = %avatar_id, error = %e, "persistent read-through failed");
                None
            }
            Err(_) => {
                debug!(avatar_id = %avatar_id, "persistent read-through timed out");
                None
            }
        }
    }
}
