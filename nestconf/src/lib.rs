//! Hierarchical, identifier-addressed configuration store.
//!
//! Data lives in a nested tree addressed by [`PathKey`]s:
//!
//! ```text
//! namespace / instance_id / category / primary_key.. / identifiers..
//!
//! core/0/GLOBAL/prefix
//! core/0/MEMBER/1234/5678/nick
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Config ─► Group ─► Value   (default overlay) │
//! │                 │                             │
//! │                 ▼                             │
//! │        ┌─────────────────┐                    │
//! │        │  CachedDriver   │ ◄── ReadCache      │
//! │        └────────┬────────┘                    │
//! │                 ▼                             │
//! │        ┌─────────────────┐                    │
//! │        │  dyn Driver     │  ← sealed trait    │
//! │        └────────┬────────┘                    │
//! │   ┌──────┬──────┼───────┬─────────┐           │
//! │   ▼      ▼      ▼       ▼         ▼           │
//! │  json   sql   mongo   redis   splitfiles      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use nestconf::{Backend, Config, StorageConfig};
//! use serde_json::json;
//!
//! # async fn example() -> nestconf::Result<()> {
//! let backend = Backend::initialize(&StorageConfig::flat_file("./data")).await?;
//! let config = Config::open(&backend, "core", "0").await?;
//! config.register_guild(json!({"prefix": "!"}))?;
//!
//! let prefix = config.guild(1234).value("prefix");
//! prefix.set(json!("?")).await?;
//! assert_eq!(prefix.get().await?, json!("?"));
//!
//! backend.teardown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `sql` (default) - SQLite backend (requires `rusqlite`)
//! - `mongo` - MongoDB backend (requires `mongodb`)
//! - `redis` - Redis + RedisJSON backend (requires `redis`)
//! - `full` - Enable all backends

mod accessor;
mod backend;
mod cache;
mod cached;
mod config;
mod defaults;
mod durable;
mod error;
pub mod escape;
mod migrate;
mod path;
mod registry;
mod traits;
pub mod tree;

pub mod drivers;

pub use accessor::{Attr, Config, Group, KeyLock, Value};
pub use backend::{Backend, BackendKind, DeleteOptions};
pub use cache::{CacheStats, ReadCache};
pub use cached::CachedDriver;
pub use config::{CacheConfig, ConnectionDetails, StorageConfig};
pub use defaults::Defaults;
pub use error::{Result, StoreError};
pub use migrate::{CustomGroups, MigrationReport, Migrator};
pub use path::{Category, PathKey};
pub use traits::Driver;

/// Resolve a backend name from configuration.
///
/// Accepts the canonical names (`json`, `sql`, `mongo`, `redis`,
/// `splitfiles`) and their aliases, case-insensitively.
///
/// # Errors
///
/// `StoreError::UnknownBackend` for any other name.
pub fn get_driver_class(name: &str) -> Result<BackendKind> {
    name.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_driver_class() {
        assert_eq!(get_driver_class("JSON").unwrap(), BackendKind::FlatFile);
        assert_eq!(get_driver_class("hash-bucket").unwrap(), BackendKind::HashBucket);
        assert!(matches!(
            get_driver_class("postgres"),
            Err(StoreError::UnknownBackend(_))
        ));
    }
}
