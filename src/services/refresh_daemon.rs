//! Periodic refresh of names relevant to active sessions.
//!
//! Each cycle asks every registered connection for its nearby avatars, keeps
//! the ids whose record is missing or due for refresh, and queues at most
//! `max_per_cycle` of them. Purely background hygiene: nothing depends on it
//! for correctness.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::{AvatarId, RefreshConfig};
use crate::services::connection_pool::ConnectionPool;
use crate::services::name_store::NameRecordStore;
use crate::services::request_queue::RequestQueue;

/// What one refresh cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub sessions: usize,
    pub candidates: usize,
    pub queued: usize,
}

/// Running totals for the refresher.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    pub running: bool,
    pub cycles: u64,
    pub total_queued: u64,
    pub last_run: Option<Instant>,
    pub last_report: Option<RefreshReport>,
}

/// Read-only view of a refresher's status.
#[derive(Clone)]
pub struct RefreshHandle {
    status: Arc<RwLock<RefreshStatus>>,
}

impl RefreshHandle {
    pub async fn status(&self) -> RefreshStatus {
        self.status.read().await.clone()
    }
}

pub struct RefreshDaemon {
    pool: Arc<ConnectionPool>,
    store: Arc<NameRecordStore>,
    requests: Arc<RequestQueue>,
    config: RefreshConfig,
    status: Arc<RwLock<RefreshStatus>>,
}

impl RefreshDaemon {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Arc<NameRecordStore>,
        requests: Arc<RequestQueue>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            pool,
            store,
            requests,
            config,
            status: Arc::new(RwLock::new(RefreshStatus::default())),
        }
    }

    pub fn handle(&self) -> RefreshHandle {
        RefreshHandle {
            status: self.status.clone(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        self.status.write().await.running = true;
        info!(interval_secs = self.config.interval_secs, max_per_cycle = self.config.max_per_cycle, "refresh daemon started");

        let mut timer = interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is not a refresh storm.
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        self.status.write().await.running = false;
        info!("refresh daemon stopped");
    }

    /// Run one refresh cycle.
    pub async fn run_cycle(&self) -> RefreshReport {
        let connections = self.pool.connections();
        let mut report = RefreshReport {
            sessions: connections.len(),
            ..RefreshReport::default()
        };

        let mut seen: HashSet<AvatarId> = HashSet::new();
        let mut candidates: Vec<AvatarId> = Vec::new();
        let now = Utc::now();

        let limit = self.config.nearby_timeout();
        let nearby = join_all(
            connections
                .iter()
                .filter(|(_, connection)| connection.is_available())
                .map(|(session_id, connection)| async move {
                    tokio::time::timeout(limit, connection.nearby_avatars())
                        .await
                        .unwrap_or_else(|_| {
                            warn!(session_id = %session_id, "nearby avatar query timed out");
                            Vec::new()
                        })
                }),
        )
        .await;

        for id in nearby.into_iter().flatten() {
            if id.is_nil() || !seen.insert(id) {
                continue;
            }
            let due = self
                .store
                .get(id)
                .map_or(true, |r| !r.has_valid_display_name() || r.is_refresh_due(now));
            if due {
                candidates.push(id);
            }
        }
        report.candidates = candidates.len();

        for id in candidates {
            if report.queued >= self.config.max_per_cycle {
                break;
            }
            if self.requests.enqueue(id).is_queued() {
                report.queued += 1;
            }
        }

        {
            let mut status = self.status.write().await;
            status.cycles += 1;
            status.total_queued += report.queued as u64;
            status.last_run = Some(Instant::now());
            status.last_report = Some(report);
        }

        debug!(
            sessions = report.sessions,
            candidates = report.candidates,
            queued = report.queued,
            "refresh cycle complete"
        );
        report
    }
}
