//! Infrastructure layer
//!
//! Configuration loading and logging setup. Storage and lookup adapters live
//! under `crate::adapters`.

pub mod config;
pub mod logging;
