//! Cache services: the volatile store, the lookup pipelines and the facade.

pub mod cache_stats;
pub mod connection_pool;
pub mod lookup_dispatcher;
pub mod name_cache;
pub mod name_events;
pub mod name_store;
pub mod persistence_sync;
pub mod refresh_daemon;
pub mod request_queue;
pub mod retry_queue;

pub use cache_stats::{CacheStats, CacheStatsSnapshot};
pub use connection_pool::ConnectionPool;
pub use lookup_dispatcher::{DispatchReport, LookupDispatcher};
pub use name_cache::{NameCache, ShutdownReport};
pub use name_events::{DisplayNameChanged, NameChangeBus};
pub use name_store::{ApplyOutcome, NameRecordStore, RecordSource};
pub use persistence_sync::{FlushReport, PersistenceSync};
pub use refresh_daemon::{RefreshDaemon, RefreshHandle, RefreshReport, RefreshStatus};
pub use request_queue::{EnqueueOutcome, RequestQueue, RequestWorker};
pub use retry_queue::{RetryDecision, RetryQueue, RetryWorker};
