//! Deduplicating request pipeline.
//!
//! Callers enqueue avatar ids; a single worker drains the queue into batches
//! (up to `batch_size` ids, or whatever arrived within `batch_window`) and hands
//! them to the dispatcher. An id already waiting, in flight, or tracked by the
//! retry pipeline is not queued again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::models::{AvatarId, PendingRequest, RequestConfig};
use crate::services::lookup_dispatcher::LookupDispatcher;
use crate::services::retry_queue::RetryQueue;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyPending,
    AlreadyRetrying,
    Closed,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Producer side of the pipeline plus the pending-marker set.
pub struct RequestQueue {
    pending: DashMap<AvatarId, PendingRequest>,
    sender: mpsc::UnboundedSender<AvatarId>,
    retries: Arc<RetryQueue>,
    pending_timeout: Duration,
    accepting: AtomicBool,
}

impl RequestQueue {
    /// Create the queue and the receiver its worker drains.
    pub fn new(
        retries: Arc<RetryQueue>,
        pending_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<AvatarId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            pending: DashMap::new(),
            sender,
            retries,
            pending_timeout,
            accepting: AtomicBool::new(true),
        };
        (queue, receiver)
    }

    /// Queue an id for lookup unless it is already on its way.
    pub fn enqueue(&self, avatar_id: AvatarId) -> EnqueueOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed;
        }
        if self.retries.is_tracked(avatar_id) {
            return EnqueueOutcome::AlreadyRetrying;
        }

        let now = Instant::now();
        match self.pending.entry(avatar_id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now, self.pending_timeout) {
                    return EnqueueOutcome::AlreadyPending;
                }
                // Marker outlived its timeout; the earlier request is presumed lost.
                occupied.insert(PendingRequest::new(avatar_id, now));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest::new(avatar_id, now));
            }
        }

        if self.sender.send(avatar_id).is_err() {
            self.pending.remove(&avatar_id);
            return EnqueueOutcome::Closed;
        }
        EnqueueOutcome::Queued
    }

    /// Clear the pending marker for an id whose batch finished.
    pub fn complete(&self, avatar_id: AvatarId) {
        self.pending.remove(&avatar_id);
    }

    pub fn complete_all(&self, avatar_ids: &[AvatarId]) {
        for id in avatar_ids {
            self.pending.remove(id);
        }
    }

    pub fn is_pending(&self, avatar_id: AvatarId) -> bool {
        self.pending.contains_key(&avatar_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop markers older than the pending timeout. Returns how many were dropped.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| !pending.is_expired(now, self.pending_timeout));
        let swept = before.saturating_sub(self.pending.len());
        if swept > 0 {
            warn!(swept, "dropped expired pending lookup markers");
        }
        swept
    }

    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }
}

/// Consumer side: batches ids and dispatches them.
pub struct RequestWorker {
    queue: Arc<RequestQueue>,
    receiver: mpsc::UnboundedReceiver<AvatarId>,
    dispatcher: Arc<LookupDispatcher>,
    config: RequestConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RequestWorker {
    pub fn new(
        queue: Arc<RequestQueue>,
        receiver: mpsc::UnboundedReceiver<AvatarId>,
        dispatcher: Arc<LookupDispatcher>,
        config: RequestConfig,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            queue,
            receiver,
            dispatcher,
            config,
            cancel,
            tracker,
        }
    }

    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            batch_window_ms = self.config.batch_window_ms,
            "request worker started"
        );

        let mut sweep = interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.queue.sweep_expired(Instant::now());
                }
                received = self.receiver.recv() => {
                    let Some(first) = received else { break };
                    let batch = self.collect_batch(first).await;
                    debug!(size = batch.len(), "request batch collected");
                    if !self.dispatcher.dispatch_with_permit(batch, &self.cancel, &self.tracker).await {
                        break;
                    }
                }
            }
        }

        // Ids still queued will not be looked up; let callers ask again later.
        while let Ok(id) = self.receiver.try_recv() {
            self.queue.complete(id);
        }
        info!(pending = self.queue.pending_count(), "request worker stopped");
    }

    /// Gather up to `batch_size` distinct ids, waiting at most `batch_window`
    /// after the first one arrived.
    async fn collect_batch(&mut self, first: AvatarId) -> Vec<AvatarId> {
        let batch_size = self.config.batch_size.max(1);
        let deadline = Instant::now() + self.config.batch_window();
        let mut seen = HashSet::with_capacity(batch_size);
        let mut batch = Vec::with_capacity(batch_size);
        seen.insert(first);
        batch.push(first);

        while batch.len() < batch_size {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(id)) => {
                    if seen.insert(id) {
                        batch.push(id);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{FailureCategory, RetryConfig};
    use crate::services::cache_stats::CacheStats;

    fn queue() -> (RequestQueue, mpsc::UnboundedReceiver<AvatarId>, Arc<RetryQueue>) {
        let retries = Arc::new(RetryQueue::new(RetryConfig::default(), Arc::new(CacheStats::new())));
        let (queue, rx) = RequestQueue::new(retries.clone(), Duration::from_secs(300));
        (queue, rx, retries)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_enqueue_is_collapsed() {
        let (queue, mut rx, _) = queue();
        let id = AvatarId::new();

        assert_eq!(queue.enqueue(id), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(id), EnqueueOutcome::AlreadyPending);
        assert_eq!(rx.recv().await, Some(id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_allows_requeue() {
        let (queue, _rx, _) = queue();
        let id = AvatarId::new();

        queue.enqueue(id);
        queue.complete(id);
        assert!(!queue.is_pending(id));
        assert_eq!(queue.enqueue(id), EnqueueOutcome::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_marker_is_replaced() {
        let (queue, _rx, _) = queue();
        let id = AvatarId::new();
        queue.enqueue(id);

        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(queue.enqueue(id), EnqueueOutcome::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_expired() {
        let (queue, _rx, _) = queue();
        let old = AvatarId::new();
        queue.enqueue(old);
        tokio::time::advance(Duration::from_secs(200)).await;
        let fresh = AvatarId::new();
        queue.enqueue(fresh);
        tokio::time::advance(Duration::from_secs(100)).await;

        assert_eq!(queue.sweep_expired(Instant::now()), 1);
        assert!(!queue.is_pending(old));
        assert!(queue.is_pending(fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_ids_are_not_queued() {
        let (queue, _rx, retries) = queue();
        let id = AvatarId::new();
        retries.record_failure(id, FailureCategory::MissingName, "no answer");

        assert_eq!(queue.enqueue(id), EnqueueOutcome::AlreadyRetrying);
        assert!(!queue.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_refuses() {
        let (queue, _rx, _) = queue();
        queue.close();
        assert_eq!(queue.enqueue(AvatarId::new()), EnqueueOutcome::Closed);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_clears_marker() {
        let (queue, rx, _) = queue();
        drop(rx);
        let id = AvatarId::new();
        assert_eq!(queue.enqueue(id), EnqueueOutcome::Closed);
        assert!(!queue.is_pending(id));
    }
}
