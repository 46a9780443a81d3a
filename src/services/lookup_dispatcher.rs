//! Sends batches to a lookup connection and routes the answers.
//!
//! Confirmed names go to the store; everything else is handed to the retry
//! pipeline with a failure category. Concurrency is bounded by a semaphore and
//! the upstream call rate by a token bucket.

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::domain::errors::LookupError;
use crate::domain::models::{AvatarId, FailureCategory, LookupResult, RateLimitConfig};
use crate::services::cache_stats::CacheStats;
use crate::services::connection_pool::ConnectionPool;
use crate::services::name_store::NameRecordStore;
use crate::services::request_queue::RequestQueue;
use crate::services::retry_queue::RetryQueue;

/// What one dispatched batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub requested: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Set when the whole batch failed at the transport level.
    pub error: Option<LookupError>,
}

pub struct LookupDispatcher {
    pool: Arc<ConnectionPool>,
    store: Arc<NameRecordStore>,
    requests: Arc<RequestQueue>,
    retries: Arc<RetryQueue>,
    stats: Arc<CacheStats>,
    permits: Arc<Semaphore>,
    limiter: Option<DefaultDirectRateLimiter>,
    lookup_timeout: Duration,
}

impl LookupDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Arc<NameRecordStore>,
        requests: Arc<RequestQueue>,
        retries: Arc<RetryQueue>,
        stats: Arc<CacheStats>,
        max_concurrent: usize,
        lookup_timeout: Duration,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        Self {
            pool,
            store,
            requests,
            retries,
            stats,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            limiter: build_limiter(rate_limit),
            lookup_timeout,
        }
    }

    /// Permits not currently held by an in-flight batch.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a concurrency permit, then run the batch on the tracker.
    ///
    /// Returns false if cancellation arrived first; the batch is then released
    /// without counting as an attempt.
    pub async fn dispatch_with_permit(
        self: &Arc<Self>,
        batch: Vec<AvatarId>,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> bool {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            self.retries.release(&batch);
            self.requests.complete_all(&batch);
            return false;
        };

        let dispatcher = Arc::clone(self);
        tracker.spawn(async move {
            let _permit = permit;
            dispatcher.dispatch(batch).await;
        });
        true
    }

    /// Look up one batch and route every id to the store or the retry pipeline.
    #[instrument(skip(self, batch), fields(size = batch.len()))]
    pub async fn dispatch(&self, batch: Vec<AvatarId>) -> DispatchReport {
        let mut report = DispatchReport {
            requested: batch.len(),
            ..DispatchReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let Some((session_id, connection)) = self.pool.select_available() else {
            let err = LookupError::Unavailable("no lookup connection registered".to_string());
            self.fail_all(&batch, err.category(), &err.to_string());
            report.failed = batch.len();
            report.error = Some(err);
            self.requests.complete_all(&batch);
            return report;
        };

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        self.stats.record_batch_dispatched();
        debug!(session_id = %session_id, "dispatching lookup batch");

        let answer = match timeout(self.lookup_timeout, connection.request_names(&batch)).await {
            Ok(answer) => answer,
            Err(_) => Err(LookupError::TimedOut(
                u64::try_from(self.lookup_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match answer {
            Ok(results) => {
                let (resolved, failed) = self.route_results(&batch, results);
                report.resolved = resolved;
                report.failed = failed;
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "lookup batch failed");
                self.fail_all(&batch, err.category(), &err.to_string());
                report.failed = batch.len();
                report.error = Some(err);
            }
        }

        self.requests.complete_all(&batch);
        report
    }

    fn route_results(&self, batch: &[AvatarId], results: Vec<LookupResult>) -> (usize, usize) {
        let mut by_id: HashMap<AvatarId, LookupResult> = HashMap::with_capacity(results.len());
        for result in results {
            if batch.contains(&result.avatar_id) {
                by_id.insert(result.avatar_id, result);
            } else {
                debug!(avatar_id = %result.avatar_id, "ignoring unrequested lookup result");
            }
        }

        let now = Utc::now();
        let refresh_after = self.store.refresh_after();
        let mut resolved = 0;
        let mut failed = 0;

        for id in batch {
            match by_id.remove(id) {
                Some(result) if result.is_confirmed() => {
                    self.store.apply(result.into_record(now, refresh_after));
                    self.retries.clear(*id);
                    resolved += 1;
                }
                Some(result) => {
                    let reason = if result.success {
                        "placeholder name returned"
                    } else {
                        "lookup reported no name"
                    };
                    self.retries.record_failure(*id, FailureCategory::MissingName, reason);
                    failed += 1;
                }
                None => {
                    self.retries
                        .record_failure(*id, FailureCategory::MissingName, "no result returned");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            self.stats.record_lookup_failures(failed as u64);
        }
        (resolved, failed)
    }

    fn fail_all(&self, batch: &[AvatarId], category: FailureCategory, reason: &str) {
        for id in batch {
            self.retries.record_failure(*id, category, reason);
        }
        self.stats.record_lookup_failures(batch.len() as u64);
    }
}

fn build_limiter(config: &RateLimitConfig) -> Option<DefaultDirectRateLimiter> {
    let rate = NonZeroU32::new(config.batches_per_second)?;
    let burst = NonZeroU32::new(config.burst_size).unwrap_or(rate);
    Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}
