//! Common test utilities for integration tests
//!
//! Shared fixtures for building a cache over the mock lookup connection and
//! the in-memory persistent tier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use namecache::adapters::lookup::MockLookupConnection;
use namecache::adapters::memory::InMemoryNameStore;
use namecache::{Config, NameCache, SessionId};
use tempfile::TempDir;

/// Default config with the wall-clock rate limiter and the refresher off, so
/// paused-time tests stay deterministic.
#[allow(dead_code)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.batches_per_second = 0;
    config.refresh.enabled = false;
    config
}

/// A started cache with one registered mock connection and a shared in-memory tier.
#[allow(dead_code)]
pub async fn started_cache(config: Config) -> (NameCache, Arc<MockLookupConnection>, InMemoryNameStore) {
    let durable = InMemoryNameStore::new();
    let cache = NameCache::new(config, Arc::new(durable.clone()));
    let connection = Arc::new(MockLookupConnection::new());
    cache.register_connection(SessionId::new(), connection.clone());
    cache.start().await;
    (cache, connection, durable)
}

/// Create a temporary SQLite database path
///
/// Returns the TempDir (keep it alive) and the database file path.
#[allow(dead_code)]
pub fn temp_db_path() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("names.db");
    (dir, db_path)
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Wait for a condition to be true, polling every 10ms of (possibly paused) time.
#[allow(dead_code)]
pub async fn wait_for<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
