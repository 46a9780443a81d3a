use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the name cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Volatile tier configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Request pipeline configuration
    #[serde(default)]
    pub requests: RequestConfig,

    /// Retry pipeline configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Periodic refresher configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Persistent tier synchronisation
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Upstream rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Time in-flight batches get to finish on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or_else(|_| chrono::Duration::max_value())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            requests: RequestConfig::default(),
            retry: RetryConfig::default(),
            refresh: RefreshConfig::default(),
            persistence: PersistenceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Config {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Volatile (in-memory) tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Maximum number of records held in memory
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Records not written for this long are evicted from memory
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Age after which a record is refreshed on read
    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,

    /// Returned on a full miss when the caller supplies no fallback
    #[serde(default = "default_loading_placeholder")]
    pub loading_placeholder: String,

    /// Capacity of the change notification channel
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

const fn default_max_entries() -> usize {
    50_000
}

const fn default_max_age_hours() -> u64 {
    48
}

const fn default_refresh_after_secs() -> u64 {
    7_200
}

fn default_loading_placeholder() -> String {
    super::name_record::LOADING_PLACEHOLDER.to_string()
}

const fn default_notification_capacity() -> usize {
    1_024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_age_hours: default_max_age_hours(),
            refresh_after_secs: default_refresh_after_secs(),
            loading_placeholder: default_loading_placeholder(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono_secs(self.max_age_hours.saturating_mul(3_600))
    }

    pub fn refresh_after(&self) -> chrono::Duration {
        chrono_secs(self.refresh_after_secs)
    }
}

/// Request pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequestConfig {
    /// Maximum ids per lookup batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a batch stays open after its first id arrives
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Pending markers older than this are swept
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,

    /// Interval between pending-marker sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum simultaneous outstanding lookups across the process
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,

    /// A lookup without an answer after this long counts as failed
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
}

const fn default_batch_size() -> usize {
    20
}

const fn default_batch_window_ms() -> u64 {
    100
}

const fn default_pending_timeout_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_max_concurrent_lookups() -> usize {
    5
}

const fn default_lookup_timeout_secs() -> u64 {
    10
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            pending_timeout_secs: default_pending_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

impl RequestConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

/// Retry pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Hard ceiling on retries per avatar id
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before each retry, indexed by attempt number - 1
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,
}

const fn default_max_attempts() -> u32 {
    3
}

fn default_delays_ms() -> Vec<u64> {
    vec![5_000, 30_000, 120_000]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_ms: default_delays_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based). Attempts past the end of
    /// the schedule reuse the last delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        let ms = self
            .delays_ms
            .get(index)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

/// Periodic refresher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RefreshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between refresh cycles
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,

    /// Maximum ids queued per cycle
    #[serde(default = "default_max_per_cycle")]
    pub max_per_cycle: usize,

    /// How long one session may take to report its nearby avatars
    #[serde(default = "default_nearby_timeout_ms")]
    pub nearby_timeout_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_refresh_interval_secs() -> u64 {
    300
}

const fn default_max_per_cycle() -> usize {
    20
}

const fn default_nearby_timeout_ms() -> u64 {
    5_000
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_refresh_interval_secs(),
            max_per_cycle: default_max_per_cycle(),
            nearby_timeout_ms: default_nearby_timeout_ms(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn nearby_timeout(&self) -> Duration {
        Duration::from_millis(self.nearby_timeout_ms)
    }
}

/// Persistent tier synchronisation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PersistenceConfig {
    /// Interval between flushes of dirty records
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Records newer than this are bulk-loaded on startup
    #[serde(default = "default_load_window_hours")]
    pub load_window_hours: u64,

    /// Durable records not written for this long are deleted. 0 disables purging.
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u64,

    /// Minimum interval between durable purges
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// First delay between upsert retries on a write conflict
    #[serde(default = "default_upsert_retry_initial_ms")]
    pub upsert_retry_initial_ms: u64,

    /// Total time spent retrying one upsert before deferring it
    #[serde(default = "default_upsert_retry_max_elapsed_ms")]
    pub upsert_retry_max_elapsed_ms: u64,

    /// Upper bound on the final flush during shutdown
    #[serde(default = "default_shutdown_flush_timeout_secs")]
    pub shutdown_flush_timeout_secs: u64,
}

const fn default_flush_interval_secs() -> u64 {
    30
}

const fn default_load_window_hours() -> u64 {
    48
}

const fn default_purge_after_days() -> u64 {
    90
}

const fn default_purge_interval_secs() -> u64 {
    3_600
}

const fn default_upsert_retry_initial_ms() -> u64 {
    25
}

const fn default_upsert_retry_max_elapsed_ms() -> u64 {
    250
}

const fn default_shutdown_flush_timeout_secs() -> u64 {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            load_window_hours: default_load_window_hours(),
            purge_after_days: default_purge_after_days(),
            purge_interval_secs: default_purge_interval_secs(),
            upsert_retry_initial_ms: default_upsert_retry_initial_ms(),
            upsert_retry_max_elapsed_ms: default_upsert_retry_max_elapsed_ms(),
            shutdown_flush_timeout_secs: default_shutdown_flush_timeout_secs(),
        }
    }
}

impl PersistenceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn load_window(&self) -> chrono::Duration {
        chrono_secs(self.load_window_hours.saturating_mul(3_600))
    }

    pub fn purge_after(&self) -> Option<chrono::Duration> {
        if self.purge_after_days == 0 {
            return None;
        }
        Some(chrono_secs(self.purge_after_days.saturating_mul(86_400)))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn upsert_retry_initial(&self) -> Duration {
        Duration::from_millis(self.upsert_retry_initial_ms)
    }

    pub fn upsert_retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.upsert_retry_max_elapsed_ms)
    }

    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_flush_timeout_secs)
    }
}

/// Rate limiting configuration for upstream lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Lookup batches per second allowed
    #[serde(default = "default_batches_per_second")]
    pub batches_per_second: u32,

    /// Burst size for the limiter
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_batches_per_second() -> u32 {
    10
}

const fn default_burst_size() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            batches_per_second: default_batches_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".namecache/names.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
