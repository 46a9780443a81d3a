//! Domain layer for the name cache
//!
//! This module contains the cached record model, the update acceptance
//! policy and the ports the cache needs from its collaborators.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, LookupError};
