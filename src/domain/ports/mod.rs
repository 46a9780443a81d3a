//! Port trait definitions (Hexagonal Architecture)
//!
//! - PersistentNameStore: durable medium-term tier that survives restarts
//! - LookupConnection: an active session able to resolve names upstream
//!
//! Both are implemented outside the cache; it only depends on these contracts.

pub mod lookup_connection;
pub mod name_store;
pub mod null_name_store;

pub use lookup_connection::LookupConnection;
pub use name_store::PersistentNameStore;
pub use null_name_store::NullNameStore;
