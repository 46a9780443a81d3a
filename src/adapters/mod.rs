//! Adapters implementing the domain ports.

pub mod lookup;
pub mod memory;
pub mod sqlite;
