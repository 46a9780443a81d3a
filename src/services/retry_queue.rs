//! Retry pipeline.
//!
//! Failed lookups wait here with growing delays and are re-dispatched by a
//! dedicated worker. Each id moves through
//! `attempt 1 → attempt 2 → … → max_attempts → abandoned`; once the ceiling is
//! passed, every trace of the id is dropped.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::models::{AvatarId, FailureCategory, RetryConfig, RetryEntry};
use crate::services::cache_stats::CacheStats;
use crate::services::lookup_dispatcher::LookupDispatcher;
use crate::services::name_store::NameRecordStore;

/// How long the worker sleeps when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(60);

/// What happened to a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// The ceiling was reached; tracking for the id is gone.
    Abandoned { attempts: u32 },
    /// The pipeline no longer accepts work.
    Closed,
}

/// Per-id retry tracking.
pub struct RetryQueue {
    entries: DashMap<AvatarId, RetryEntry>,
    notify: Notify,
    config: RetryConfig,
    stats: Arc<CacheStats>,
    accepting: AtomicBool,
}

impl RetryQueue {
    pub fn new(config: RetryConfig, stats: Arc<CacheStats>) -> Self {
        Self {
            entries: DashMap::new(),
            notify: Notify::new(),
            config,
            stats,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Record a failed lookup and schedule the next attempt.
    pub fn record_failure(
        &self,
        avatar_id: AvatarId,
        category: FailureCategory,
        reason: impl Into<String>,
    ) -> RetryDecision {
        let reason = reason.into();
        let now = Instant::now();

        let decision = match self.entries.entry(avatar_id) {
            Entry::Vacant(vacant) => {
                if !self.accepting.load(Ordering::Acquire) {
                    return RetryDecision::Closed;
                }
                let delay = self.config.delay_for(1);
                vacant.insert(RetryEntry {
                    avatar_id,
                    first_attempt_at: Utc::now(),
                    next_retry_at: now + delay,
                    attempt_count: 1,
                    last_failure_reason: reason.clone(),
                    failure_category: category,
                    in_flight: false,
                });
                RetryDecision::Scheduled { attempt: 1, delay }
            }
            Entry::Occupied(mut occupied) => {
                let attempt = occupied.get().attempt_count + 1;
                if attempt > self.config.max_attempts {
                    let (_, entry) = occupied.remove_entry();
                    RetryDecision::Abandoned {
                        attempts: entry.attempt_count,
                    }
                } else {
                    let delay = self.config.delay_for(attempt);
                    let entry = occupied.get_mut();
                    entry.attempt_count = attempt;
                    entry.next_retry_at = now + delay;
                    entry.last_failure_reason.clone_from(&reason);
                    entry.failure_category = category;
                    entry.in_flight = false;
                    RetryDecision::Scheduled { attempt, delay }
                }
            }
        };

        match decision {
            RetryDecision::Scheduled { attempt, delay } => {
                self.stats.record_retry_scheduled();
                debug!(
                    avatar_id = %avatar_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    category = category.as_str(),
                    reason = %reason,
                    "lookup retry scheduled"
                );
                self.notify.notify_one();
            }
            RetryDecision::Abandoned { attempts } => {
                self.stats.record_retry_abandoned();
                warn!(
                    avatar_id = %avatar_id,
                    attempts,
                    category = category.as_str(),
                    reason = %reason,
                    "lookup abandoned after max retries"
                );
            }
            RetryDecision::Closed => {}
        }

        decision
    }

    /// Forget an id, typically after it resolved. Returns true if it was tracked.
    pub fn clear(&self, avatar_id: AvatarId) -> bool {
        self.entries.remove(&avatar_id).is_some()
    }

    pub fn is_tracked(&self, avatar_id: AvatarId) -> bool {
        self.entries.contains_key(&avatar_id)
    }

    pub fn get(&self, avatar_id: AvatarId) -> Option<RetryEntry> {
        self.entries.get(&avatar_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Claim up to `max` entries whose delay has elapsed, oldest deadline first.
    pub fn take_ready(&self, now: Instant, max: usize) -> Vec<RetryEntry> {
        let mut ready: Vec<(AvatarId, Instant)> = self
            .entries
            .iter()
            .filter(|e| e.is_ready(now))
            .map(|e| (*e.key(), e.next_retry_at))
            .collect();
        ready.sort_by_key(|(_, at)| *at);

        ready
            .into_iter()
            .filter_map(|(id, _)| {
                let mut entry = self.entries.get_mut(&id)?;
                if !entry.is_ready(now) {
                    return None;
                }
                entry.in_flight = true;
                Some(entry.clone())
            })
            .take(max)
            .collect()
    }

    /// Hand claimed entries back without counting an attempt.
    pub fn release(&self, avatar_ids: &[AvatarId]) {
        for id in avatar_ids {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.in_flight = false;
            }
        }
    }

    /// Earliest deadline among entries not currently in flight.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| !e.in_flight)
            .map(|e| e.next_retry_at)
            .min()
    }

    /// Stop accepting new ids. Already tracked ids may still advance.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Worker that re-dispatches due retries.
pub struct RetryWorker {
    retries: Arc<RetryQueue>,
    store: Arc<NameRecordStore>,
    dispatcher: Arc<LookupDispatcher>,
    batch_size: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RetryWorker {
    pub fn new(
        retries: Arc<RetryQueue>,
        store: Arc<NameRecordStore>,
        dispatcher: Arc<LookupDispatcher>,
        batch_size: usize,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            retries,
            store,
            dispatcher,
            batch_size: batch_size.max(1),
            cancel,
            tracker,
        }
    }

    pub async fn run(self) {
        info!("retry worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let ready = self.retries.take_ready(Instant::now(), self.batch_size);
            if !ready.is_empty() {
                let batch = self.skip_resolved(ready);
                if !batch.is_empty()
                    && !self
                        .dispatcher
                        .dispatch_with_permit(batch, &self.cancel, &self.tracker)
                        .await
                {
                    break;
                }
                continue;
            }

            let wake_at = self
                .retries
                .next_due()
                .unwrap_or_else(|| Instant::now() + IDLE_POLL);

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.retries.notified() => {}
                () = sleep_until(wake_at) => {}
            }
        }

        info!(tracked = self.retries.len(), "retry worker stopped");
    }

    /// Drop ids that resolved through another path since their first failure.
    fn skip_resolved(&self, ready: Vec<RetryEntry>) -> Vec<AvatarId> {
        ready
            .into_iter()
            .filter_map(|entry| {
                let resolved = self
                    .store
                    .get(entry.avatar_id)
                    .is_some_and(|r| r.has_valid_display_name() && r.cached_at >= entry.first_attempt_at);
                if resolved {
                    debug!(avatar_id = %entry.avatar_id, "retry skipped, name already resolved");
                    self.retries.clear(entry.avatar_id);
                    None
                } else {
                    Some(entry.avatar_id)
                }
            })
            .collect()
    }
}
