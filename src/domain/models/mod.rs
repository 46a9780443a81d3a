//! Domain models for the name cache.

pub mod config;
pub mod display;
pub mod identity;
pub mod lookup;
pub mod name_record;

pub use config::{
    CacheConfig, Config, DatabaseConfig, LoggingConfig, PersistenceConfig, RateLimitConfig,
    RefreshConfig, RequestConfig, RetryConfig,
};
pub use display::NameDisplayMode;
pub use identity::{AvatarId, SessionId};
pub use lookup::{FailureCategory, LookupResult, PendingRequest, RetryEntry};
pub use name_record::{
    evaluate_update, is_invalid_name, NameRecord, RejectReason, UpdateDecision,
    INVALID_NAME_PLACEHOLDERS, LEGACY_PLACEHOLDER_LAST_NAME, LOADING_PLACEHOLDER,
};
