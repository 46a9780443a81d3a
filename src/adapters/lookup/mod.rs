//! Lookup connection adapters.

pub mod mock;

pub use mock::MockLookupConnection;
