//! End-to-end behaviour of the cache over the mock lookup connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{started_cache, test_config, wait_for};
use namecache::adapters::lookup::MockLookupConnection;
use namecache::adapters::memory::InMemoryNameStore;
use namecache::domain::models::LOADING_PLACEHOLDER;
use namecache::{
    AvatarId, DomainResult, LookupError, LookupResult, NameCache, NameDisplayMode, NameRecord,
    PersistentNameStore, SessionId,
};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn scenario_a_miss_returns_placeholder_and_queues_one_request() {
    let cache = NameCache::new(test_config(), Arc::new(InMemoryNameStore::new()));
    let x = AvatarId::new();
    let connection = Arc::new(MockLookupConnection::with_names([(x, "Bob")]));
    cache.register_connection(SessionId::new(), connection.clone());

    assert_eq!(cache.get_display_name_async(x, NameDisplayMode::Smart).await, LOADING_PLACEHOLDER);
    assert_eq!(cache.get_display_name_async(x, NameDisplayMode::Smart).await, LOADING_PLACEHOLDER);
    assert_eq!(cache.pending_count(), 1);

    cache.start().await;
    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(5)).await);
    assert_eq!(connection.times_requested(x), 1);
    assert!(!cache.is_pending(x));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_default_lookup_does_not_replace_custom_name() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let x = AvatarId::new();
    cache.update_from_lookup(vec![LookupResult::resolved(x, "Jara")]);
    connection.set_name(
        x,
        LookupResult::resolved(x, "Jara Lowell")
            .with_legacy_name("Jara", "Lowell")
            .as_default_display_name(),
    );

    cache.request_lookup(x);
    assert!(wait_for(|| connection.call_count() == 1 && !cache.is_pending(x), Duration::from_secs(5)).await);

    assert_eq!(cache.get_display_name(x, NameDisplayMode::DisplayNameOnly, None), "Jara");
    assert!(!cache.get_record(x).unwrap().is_default_display_name);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_lookup_result_is_stored_and_formatted() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));

    let before = Utc::now();
    assert!(cache.request_lookup(x));
    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(5)).await);
    let after = Utc::now();

    assert_eq!(cache.get_display_name_async(x, NameDisplayMode::Smart).await, "Bob");
    let record = cache.get_record(x).unwrap();
    assert!(record.last_updated >= before && record.last_updated <= after);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_failing_id_is_purged_after_max_retries() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let y = AvatarId::new();

    cache.request_lookup(y);
    assert!(wait_for(|| cache.is_retrying(y), Duration::from_secs(1)).await);

    // Initial attempt plus three retries after 5s, 30s and 120s.
    assert!(
        wait_for(
            || connection.times_requested(y) == 4 && !cache.is_retrying(y),
            Duration::from_secs(300)
        )
        .await
    );
    assert!(!cache.is_pending(y));
    assert!(!cache.is_retrying(y));
    assert_eq!(cache.stats().retries_abandoned, 1);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connection.times_requested(y), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_delays_follow_schedule() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let y = AvatarId::new();

    cache.request_lookup(y);
    assert!(wait_for(|| connection.times_requested(y) == 1, Duration::from_secs(1)).await);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(connection.times_requested(y), 1, "no retry before the first delay");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connection.times_requested(y), 2);

    tokio::time::sleep(Duration::from_secs(28)).await;
    assert_eq!(connection.times_requested(y), 2, "second delay is 30s");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(connection.times_requested(y), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_for_one_id_are_deduplicated() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let cache = Arc::new(cache);
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));

    let readers: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_display_name_async(x, NameDisplayMode::Smart).await })
        })
        .collect();
    for name in futures::future::join_all(readers).await {
        let name = name.unwrap();
        assert!(name == LOADING_PLACEHOLDER || name == "Bob");
    }

    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(5)).await);
    assert_eq!(connection.times_requested(x), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_ids_are_batched_by_size() {
    let ids: Vec<AvatarId> = (0..45).map(|_| AvatarId::new()).collect();
    let (cache, connection, _) = started_cache(test_config()).await;
    for (i, id) in ids.iter().enumerate() {
        connection.set_name(*id, LookupResult::resolved(*id, format!("Avatar {i}")));
    }

    for id in &ids {
        cache.request_lookup(*id);
    }
    assert!(wait_for(|| cache.len() == 45, Duration::from_secs(5)).await);

    let mut sizes: Vec<usize> = connection.requested_batches().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5, 20, 20]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_lookups_are_bounded_by_permits() {
    let ids: Vec<AvatarId> = (0..200).map(|_| AvatarId::new()).collect();
    let (cache, connection, _) = started_cache(test_config()).await;
    for id in &ids {
        connection.set_name(*id, LookupResult::resolved(*id, "Someone"));
    }
    connection.set_delay(Duration::from_secs(1));

    for id in &ids {
        cache.request_lookup(*id);
    }
    assert!(wait_for(|| cache.len() == 200, Duration::from_secs(30)).await);

    assert_eq!(connection.call_count(), 10);
    assert!(connection.peak_in_flight() <= 5);
    assert!(connection.peak_in_flight() > 1);
}

#[tokio::test(start_paused = true)]
async fn missing_connection_is_retried_until_one_registers() {
    let cache = NameCache::new(test_config(), Arc::new(InMemoryNameStore::new()));
    cache.start().await;
    let x = AvatarId::new();

    cache.request_lookup(x);
    assert!(wait_for(|| cache.is_retrying(x), Duration::from_secs(1)).await);

    cache.register_connection(SessionId::new(), Arc::new(MockLookupConnection::with_names([(x, "Bob")])));
    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(10)).await);
    assert!(!cache.is_retrying(x));
}

#[tokio::test(start_paused = true)]
async fn slow_connection_times_out_and_retries() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));
    connection.set_delay(Duration::from_secs(60));

    cache.request_lookup(x);
    assert!(wait_for(|| cache.is_retrying(x), Duration::from_secs(12)).await);
    assert!(cache.get_record(x).is_none());
}

#[tokio::test(start_paused = true)]
async fn transport_errors_are_retried_with_network_category() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));
    connection.fail_with(Some(LookupError::Transport("connection reset".into())));

    cache.request_lookup(x);
    assert!(wait_for(|| cache.is_retrying(x), Duration::from_secs(1)).await);

    connection.fail_with(None);
    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(10)).await);
    assert_eq!(connection.times_requested(x), 2);
}

#[tokio::test(start_paused = true)]
async fn accepted_changes_are_announced_once() {
    let (cache, connection, _) = started_cache(test_config()).await;
    let mut changes = cache.subscribe();
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));

    cache.request_lookup(x);
    let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.avatar_id, x);
    assert_eq!(change.current, "Bob");

    cache.update_from_lookup(vec![LookupResult::resolved(x, "Bob")]);
    cache.update_from_lookup(vec![LookupResult::resolved(x, "Bob Default").as_default_display_name()]);
    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

    cache.update_from_lookup(vec![LookupResult::resolved(x, "Robert")]);
    let change = changes.recv().await.unwrap();
    assert_eq!(change.previous.as_deref(), Some("Bob"));
    assert_eq!(change.current, "Robert");
}

#[tokio::test(start_paused = true)]
async fn persistent_tier_serves_read_through_without_lookup() {
    let durable = InMemoryNameStore::new();
    let x = AvatarId::new();
    durable
        .seed(
            NameRecord::new(x, "Bob")
                .with_legacy_name("Bob", "Resident")
                .with_next_refresh(Utc::now() + chrono::Duration::hours(1)),
        )
        .await;
    let cache = NameCache::new(test_config(), Arc::new(durable));

    assert_eq!(cache.get_display_name_async(x, NameDisplayMode::Smart).await, "Bob");
    assert_eq!(cache.get_legacy_name_async(x).await, "Bob");
    assert_eq!(cache.get_user_name_async(x).await, "bob");
    assert_eq!(cache.pending_count(), 0);
    assert_eq!(cache.stats().durable_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn restart_warms_from_persistent_tier() {
    let durable = InMemoryNameStore::new();
    let x = AvatarId::new();

    let first = NameCache::new(test_config(), Arc::new(durable.clone()));
    first.start().await;
    first.update_from_lookup(vec![LookupResult::resolved(x, "Bob")]);
    first.shutdown().await;

    let second = NameCache::new(test_config(), Arc::new(durable.clone()));
    second.start().await;

    assert_eq!(second.get_display_name(x, NameDisplayMode::Smart, None), "Bob");
    assert_eq!(second.pending_count(), 0);
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_dirty_records() {
    let (cache, connection, durable) = started_cache(test_config()).await;
    let x = AvatarId::new();
    connection.set_name(x, LookupResult::resolved(x, "Bob"));
    cache.request_lookup(x);
    assert!(wait_for(|| cache.get_record(x).is_some(), Duration::from_secs(5)).await);
    assert!(durable.is_empty().await);

    let report = cache.shutdown().await;

    assert!(report.drained);
    assert_eq!(report.flush.unwrap().written, 1);
    assert_eq!(durable.get(x).await.unwrap().unwrap().display_name, "Bob");
    assert!(!cache.request_lookup(AvatarId::new()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_with_unavailable_tier_completes() {
    let (cache, _, durable) = started_cache(test_config()).await;
    cache.update_from_lookup(vec![LookupResult::resolved(AvatarId::new(), "Bob")]);
    durable.set_unavailable(true);

    let report = cache.shutdown().await;

    assert_eq!(report.flush.unwrap().failed, 1);
}

/// A persistent tier that never answers.
struct StuckStore;

#[async_trait]
impl PersistentNameStore for StuckStore {
    async fn load(&self, _cutoff: Option<DateTime<Utc>>) -> DomainResult<Vec<NameRecord>> {
        Ok(Vec::new())
    }

    async fn get(&self, _avatar_id: AvatarId) -> DomainResult<Option<NameRecord>> {
        std::future::pending().await
    }

    async fn upsert(&self, _record: &NameRecord) -> DomainResult<()> {
        std::future::pending().await
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> DomainResult<u64> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_flush_is_bounded_when_tier_hangs() {
    let cache = NameCache::new(test_config(), Arc::new(StuckStore));
    cache.start().await;
    cache.update_from_lookup(vec![LookupResult::resolved(AvatarId::new(), "Bob")]);

    let report = tokio::time::timeout(Duration::from_secs(30), cache.shutdown())
        .await
        .expect("shutdown must not hang");

    assert!(report.drained);
    assert!(report.flush.is_none());
}

#[tokio::test(start_paused = true)]
async fn refresher_queues_nearby_avatars() {
    let mut config = test_config();
    config.refresh.enabled = true;
    let (cache, connection, _) = started_cache(config).await;
    let nearby: Vec<AvatarId> = (0..3).map(|_| AvatarId::new()).collect();
    for id in &nearby {
        connection.set_name(*id, LookupResult::resolved(*id, "Neighbour"));
    }
    connection.set_nearby(nearby.clone());

    tokio::time::sleep(Duration::from_secs(301)).await;

    assert!(wait_for(|| nearby.iter().all(|id| cache.get_record(*id).is_some()), Duration::from_secs(5)).await);
    let status = cache.refresh_status().await.unwrap();
    assert_eq!(status.cycles, 1);
    assert_eq!(status.total_queued, 3);
}
