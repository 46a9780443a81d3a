//! Configuration loading.
//!
//! Defaults, then `.namecache/config.yaml` and `.namecache/local.yaml`, then
//! `NAMECACHE_*` environment variables, validated before use.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
