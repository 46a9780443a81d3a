//! Namecache - avatar name resolution cache
//!
//! Resolves opaque avatar ids to human-readable names for chat, greeters and
//! statistics. Names live in two tiers: a volatile in-memory store and a
//! persistent tier that survives restarts. Misses are looked up upstream in
//! deduplicated batches through whichever sessions are connected, failures
//! are retried on a fixed schedule, and a write policy guarantees a custom
//! display name is never replaced by a default one.
//!
//! # Architecture
//!
//! Hexagonal layout:
//!
//! - **Domain Layer** (`domain`): records, the acceptance policy, config and ports
//! - **Service Layer** (`services`): store, request/retry pipelines, refresher, flusher, facade
//! - **Adapters** (`adapters`): SQLite and in-memory persistent tiers, mock lookup connection
//! - **Infrastructure Layer** (`infrastructure`): configuration loading and logging
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use namecache::{ConfigLoader, NameCache, NameDisplayMode, SessionId};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let cache = NameCache::with_sqlite(config).await?;
//!     cache.start().await;
//!     cache.register_connection(SessionId::new(), Arc::new(my_session));
//!
//!     let name = cache.get_display_name_async(avatar_id, NameDisplayMode::Smart).await;
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult, LookupError};
pub use domain::models::{
    AvatarId, Config, FailureCategory, LookupResult, NameDisplayMode, NameRecord, SessionId,
};
pub use domain::ports::{LookupConnection, NullNameStore, PersistentNameStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::logging::{LogConfig, LoggerImpl};
pub use services::{CacheStatsSnapshot, DisplayNameChanged, NameCache, ShutdownReport};
