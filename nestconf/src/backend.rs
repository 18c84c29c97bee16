//! Backend selection and process-wide backend handles.
//!
//! [`BackendKind`] is the closed set of storage engines. [`Backend`] owns the
//! process-wide state of one initialized engine (shared file registry,
//! connection, pool) plus the optional read cache, and hands out per-namespace
//! [`Driver`]s.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::cache::ReadCache;
use crate::cached::CachedDriver;
use crate::config::StorageConfig;
use crate::drivers::json::JsonBackend;
use crate::drivers::splitfiles::SplitFilesBackend;
use crate::error::{Result, StoreError};
use crate::path::PathKey;
use crate::traits::Driver;

#[cfg(feature = "mongo")]
use crate::drivers::mongo::MongoBackend;
#[cfg(feature = "redis")]
use crate::drivers::redis::RedisBackend;
#[cfg(feature = "sql")]
use crate::drivers::sql::SqlBackend;

/// Storage engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// One JSON file per namespace
    FlatFile,
    /// SQLite with registered document procedures
    Relational,
    /// MongoDB, one collection per namespace category
    DocumentStore,
    /// Redis with RedisJSON
    KeyPath,
    /// Hashed MessagePack bucket files
    HashBucket,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::FlatFile,
        BackendKind::Relational,
        BackendKind::DocumentStore,
        BackendKind::KeyPath,
        BackendKind::HashBucket,
    ];

    /// Canonical configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::FlatFile => "json",
            BackendKind::Relational => "sql",
            BackendKind::DocumentStore => "mongo",
            BackendKind::KeyPath => "redis",
            BackendKind::HashBucket => "splitfiles",
        }
    }

    /// Cargo feature that compiles this engine in, if it is optional.
    pub fn feature(&self) -> Option<&'static str> {
        match self {
            BackendKind::Relational => Some("sql"),
            BackendKind::DocumentStore => Some("mongo"),
            BackendKind::KeyPath => Some("redis"),
            BackendKind::FlatFile | BackendKind::HashBucket => None,
        }
    }

    /// Whether this build can initialize the engine.
    pub fn is_available(&self) -> bool {
        match self {
            BackendKind::FlatFile | BackendKind::HashBucket => true,
            BackendKind::Relational => cfg!(feature = "sql"),
            BackendKind::DocumentStore => cfg!(feature = "mongo"),
            BackendKind::KeyPath => cfg!(feature = "redis"),
        }
    }

    fn missing(&self) -> StoreError {
        StoreError::MissingDependency {
            backend: self.to_string(),
            feature: self.feature().unwrap_or("default"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "flat-file" | "flatfile" => Ok(BackendKind::FlatFile),
            "sql" | "sqlite" | "relational" => Ok(BackendKind::Relational),
            "mongo" | "mongodb" | "document-store" => Ok(BackendKind::DocumentStore),
            "redis" | "key-path" => Ok(BackendKind::KeyPath),
            "splitfiles" | "hash-bucket" => Ok(BackendKind::HashBucket),
            _ => Err(StoreError::UnknownBackend(s.to_string())),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`Backend::delete_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Drop the whole database or data directory instead of deleting
    /// namespace by namespace.
    pub drop_target: bool,
}

#[derive(Clone)]
enum Handle {
    FlatFile(JsonBackend),
    HashBucket(SplitFilesBackend),
    #[cfg(feature = "sql")]
    Relational(SqlBackend),
    #[cfg(feature = "mongo")]
    DocumentStore(MongoBackend),
    #[cfg(feature = "redis")]
    KeyPath(RedisBackend),
}

/// An initialized storage engine.
#[derive(Clone)]
pub struct Backend {
    kind: BackendKind,
    handle: Handle,
    cache: Option<Arc<ReadCache>>,
    torn_down: Arc<AtomicBool>,
}

impl Backend {
    /// Open the engine named by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingDependency` if the engine's feature is not
    /// compiled in, or the engine's own error if it cannot be reached.
    #[instrument(skip(config), fields(backend = %config.backend))]
    pub async fn initialize(config: &StorageConfig) -> Result<Self> {
        let kind = config.backend;
        let handle = match kind {
            BackendKind::FlatFile => Handle::FlatFile(JsonBackend::initialize(&config.connection).await?),
            BackendKind::HashBucket => {
                Handle::HashBucket(SplitFilesBackend::initialize(&config.connection).await?)
            }
            #[cfg(feature = "sql")]
            BackendKind::Relational => Handle::Relational(SqlBackend::initialize(config).await?),
            #[cfg(feature = "mongo")]
            BackendKind::DocumentStore => Handle::DocumentStore(MongoBackend::initialize(config).await?),
            #[cfg(feature = "redis")]
            BackendKind::KeyPath => Handle::KeyPath(RedisBackend::initialize(config).await?),
            #[allow(unreachable_patterns)]
            other => return Err(other.missing()),
        };
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ReadCache::new(config.cache.max_entries)));
        info!(cache = cache.is_some(), "Backend initialized");
        Ok(Self {
            kind,
            handle,
            cache,
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn cache(&self) -> Option<&Arc<ReadCache>> {
        self.cache.as_ref()
    }

    /// Driver for one namespace instance, behind the read cache if enabled.
    pub async fn driver(&self, namespace: &str, instance_id: &str) -> Result<Arc<dyn Driver>> {
        let raw = self.raw_driver(namespace, instance_id).await?;
        Ok(match &self.cache {
            Some(cache) => Arc::new(CachedDriver::new(raw, Arc::clone(cache))),
            None => raw,
        })
    }

    /// Driver for one namespace instance that bypasses the read cache.
    pub async fn raw_driver(&self, namespace: &str, instance_id: &str) -> Result<Arc<dyn Driver>> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(StoreError::Backend(format!("backend `{}` is torn down", self.kind)));
        }
        Ok(match &self.handle {
            Handle::FlatFile(b) => Arc::new(b.driver(namespace, instance_id).await?),
            Handle::HashBucket(b) => Arc::new(b.driver(namespace, instance_id).await?),
            #[cfg(feature = "sql")]
            Handle::Relational(b) => Arc::new(b.driver(namespace, instance_id)),
            #[cfg(feature = "mongo")]
            Handle::DocumentStore(b) => Arc::new(b.driver(namespace, instance_id)),
            #[cfg(feature = "redis")]
            Handle::KeyPath(b) => Arc::new(b.driver(namespace, instance_id)),
        })
    }

    /// Every `(namespace, instance_id)` that has stored data.
    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        match &self.handle {
            Handle::FlatFile(b) => b.iterate_namespaces(),
            Handle::HashBucket(b) => b.iterate_namespaces(),
            #[cfg(feature = "sql")]
            Handle::Relational(b) => b.iterate_namespaces(),
            #[cfg(feature = "mongo")]
            Handle::DocumentStore(b) => b.iterate_namespaces(),
            #[cfg(feature = "redis")]
            Handle::KeyPath(b) => b.iterate_namespaces(),
        }
    }

    /// Delete everything this backend stores.
    #[instrument(skip(self), fields(backend = %self.kind))]
    pub async fn delete_all(&self, options: DeleteOptions) -> Result<()> {
        if options.drop_target {
            match &self.handle {
                Handle::FlatFile(b) => b.drop_target().await?,
                Handle::HashBucket(b) => b.drop_target().await?,
                #[cfg(feature = "sql")]
                Handle::Relational(b) => b.drop_target().await?,
                #[cfg(feature = "mongo")]
                Handle::DocumentStore(b) => b.drop_target().await?,
                #[cfg(feature = "redis")]
                Handle::KeyPath(b) => b.drop_target().await?,
            }
        } else {
            let owners: Vec<(String, String)> = self.iterate_namespaces().try_collect().await?;
            for (namespace, instance_id) in &owners {
                let driver = self.raw_driver(namespace, instance_id).await?;
                driver
                    .clear(&PathKey::for_namespace(namespace.as_str(), instance_id.as_str()))
                    .await?;
            }
            info!(owners = owners.len(), "Deleted all namespaces");
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }

    /// Release process-wide resources. Safe to call more than once.
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            warn!(backend = %self.kind, "Backend already torn down");
            return Ok(());
        }
        match &self.handle {
            Handle::FlatFile(b) => b.teardown().await?,
            Handle::HashBucket(b) => b.teardown().await?,
            #[cfg(feature = "sql")]
            Handle::Relational(b) => b.teardown().await?,
            #[cfg(feature = "mongo")]
            Handle::DocumentStore(b) => b.teardown().await?,
            #[cfg(feature = "redis")]
            Handle::KeyPath(b) => b.teardown().await?,
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!(backend = %self.kind, "Backend torn down");
        Ok(())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_aliases_case_insensitive() {
        assert_eq!("JSON".parse::<BackendKind>().unwrap(), BackendKind::FlatFile);
        assert_eq!("Hash-Bucket".parse::<BackendKind>().unwrap(), BackendKind::HashBucket);
        assert!(matches!(
            "postgres".parse::<BackendKind>(),
            Err(StoreError::UnknownBackend(_))
        ));
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[cfg(not(feature = "mongo"))]
    #[tokio::test]
    async fn test_missing_feature_reported() {
        let mut config = StorageConfig::default();
        config.backend = BackendKind::DocumentStore;
        config.connection.url = Some("mongodb://localhost".to_string());
        let err = Backend::initialize(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingDependency { feature: "mongo", .. }));
    }

    #[tokio::test]
    async fn test_delete_all_by_namespace() {
        let dir = TempDir::new().unwrap();
        let backend = Backend::initialize(&StorageConfig::flat_file(dir.path()))
            .await
            .unwrap();
        for ns in ["a", "b"] {
            let driver = backend.driver(ns, "0").await.unwrap();
            let key = PathKey::for_category(ns, "0", crate::path::Category::Global, 0, false);
            driver.set(&key.with_identifier("x"), json!(1)).await.unwrap();
        }

        backend.delete_all(DeleteOptions::default()).await.unwrap();

        let driver = backend.driver("a", "0").await.unwrap();
        assert!(driver
            .get(&PathKey::for_namespace("a", "0"))
            .await
            .unwrap_err()
            .is_not_found());

        backend.teardown().await.unwrap();
        backend.teardown().await.unwrap();
        assert!(backend.driver("a", "0").await.is_err());
    }
}
