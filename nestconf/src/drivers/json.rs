//! Flat-file JSON driver.
//!
//! Each namespace keeps one document at `{data_path}/{namespace}/settings.json`
//! shaped as `{instance_id: {category: {primary_key..: document}}}`. The parsed
//! tree lives in memory, shared by every driver for the namespace through the
//! [`SharedRegistry`]; reads serve a deep copy of it, writes build the next tree
//! off the event loop, persist it with [`durable::write_atomic`] and only then
//! publish it.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde_json::{Map, Number, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::backend::BackendKind;
use crate::config::ConnectionDetails;
use crate::durable;
use crate::error::{Result, StoreError};
use crate::path::PathKey;
use crate::registry::{Lease, SharedRegistry};
use crate::traits::{ensure_owner, require_document_level, sealed, validate_owner_name, Driver};
use crate::tree;

const SETTINGS_FILE: &str = "settings.json";

/// In-memory copy of one `settings.json`.
pub(crate) struct NamespaceFile {
    path: PathBuf,
    tree: RwLock<Arc<Value>>,
    write_lock: Arc<Mutex<()>>,
}

impl NamespaceFile {
    async fn load(path: PathBuf) -> Result<Self> {
        let tree = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if let Some(dir) = path.parent().map(Path::to_path_buf) {
            let swept = tokio::task::spawn_blocking(move || durable::sweep_temp_files(&dir)).await??;
            if swept > 0 {
                info!(path = %path.display(), swept, "Removed temp files from an interrupted write");
            }
        }
        debug!(path = %path.display(), "Loaded namespace file");
        Ok(Self {
            path,
            tree: RwLock::new(Arc::new(tree)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.tree.read())
    }

    /// Apply `f` to a copy of the tree; persist and publish it if `f`
    /// reports a change.
    ///
    /// The work runs on the blocking pool while holding the namespace write
    /// lock, so a caller that stops waiting cannot interleave with the next
    /// writer.
    async fn mutate<T, F>(self: Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Value) -> Result<(T, bool)> + Send + 'static,
    {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut next = (*self.snapshot()).clone();
            let (out, changed) = f(&mut next)?;
            if changed {
                let bytes = serde_json::to_vec(&next)?;
                durable::write_atomic(&self.path, &bytes)?;
                *self.tree.write() = Arc::new(next);
            }
            Ok(out)
        })
        .await?
    }

    async fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *self.tree.write() = Arc::new(Value::Object(Map::new()));
        Ok(())
    }
}

/// Process-wide state of the flat-file backend.
#[derive(Clone)]
pub struct JsonBackend {
    base: PathBuf,
    files: Arc<SharedRegistry<NamespaceFile>>,
}

impl JsonBackend {
    pub async fn initialize(details: &ConnectionDetails) -> Result<Self> {
        fs::create_dir_all(&details.data_path).await?;
        info!(path = %details.data_path.display(), "Flat-file backend ready");
        Ok(Self {
            base: details.data_path.clone(),
            files: SharedRegistry::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn settings_path(&self, namespace: &str) -> PathBuf {
        self.base.join(namespace).join(SETTINGS_FILE)
    }

    pub async fn driver(&self, namespace: &str, instance_id: &str) -> Result<JsonDriver> {
        validate_owner_name(namespace)?;
        let path = self.settings_path(namespace);
        let file = self
            .files
            .acquire(namespace, || NamespaceFile::load(path))
            .await?;
        Ok(JsonDriver {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            file,
        })
    }

    /// Scan namespace directories for stored instances.
    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        let base = self.base.clone();
        let files = Arc::clone(&self.files);
        Box::pin(try_stream! {
            let mut entries = match fs::read_dir(&base).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => Err::<fs::ReadDir, StoreError>(e.into())?,
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let namespace = entry.file_name().to_string_lossy().into_owned();
                let tree = match files.peek(&namespace) {
                    Some(live) => live.snapshot(),
                    None => match fs::read(entry.path().join(SETTINGS_FILE)).await {
                        Ok(bytes) => Arc::new(serde_json::from_slice::<Value>(&bytes)?),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => Err::<Arc<Value>, StoreError>(e.into())?,
                    },
                };
                let instances: Vec<String> = tree
                    .as_object()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                for instance_id in instances {
                    yield (namespace.clone(), instance_id);
                }
            }
        })
    }

    /// Remove every namespace file and the data directory contents.
    pub async fn drop_target(&self) -> Result<()> {
        for (name, live) in self.files.live() {
            debug!(namespace = %name, "Resetting live namespace file");
            live.reset().await?;
        }
        match fs::remove_dir_all(&self.base).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.base).await?;
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn open_files(&self, namespace: &str) -> usize {
        self.files.ref_count(namespace)
    }
}

/// Flat-file driver for one namespace instance.
pub struct JsonDriver {
    namespace: String,
    instance_id: String,
    file: Lease<NamespaceFile>,
}

impl JsonDriver {
    fn full_path(&self, key: &PathKey) -> Vec<String> {
        std::iter::once(self.instance_id.clone())
            .chain(key.segments().into_iter().map(str::to_string))
            .collect()
    }
}

impl sealed::Sealed for JsonDriver {}

#[async_trait]
impl Driver for JsonDriver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::FlatFile
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        ensure_owner(self, key)?;
        let snapshot = self.file.snapshot();
        tree::get_path(&snapshot, &self.full_path(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        ensure_owner(self, key)?;
        let path = self.full_path(key);
        let label = key.to_string();
        self.file
            .shared()
            .mutate(move |root| {
                tree::set_path(root, &path, value)
                    .map_err(|_| StoreError::CannotSetSubfield(label))?;
                Ok(((), true))
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn clear(&self, key: &PathKey) -> Result<()> {
        ensure_owner(self, key)?;
        let path = self.full_path(key);
        self.file
            .shared()
            .mutate(move |root| Ok(((), tree::clear_path(root, &path))))
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let path = self.full_path(key);
        let label = key.to_string();
        self.file
            .shared()
            .mutate(move |root| {
                let next = tree::incremented(tree::get_path(root, &path), &delta, &default, &label)?;
                tree::set_path(root, &path, Value::Number(next.clone()))
                    .map_err(|_| StoreError::CannotSetSubfield(label))?;
                Ok((next, true))
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let path = self.full_path(key);
        let label = key.to_string();
        self.file
            .shared()
            .mutate(move |root| {
                let next = tree::toggled(tree::get_path(root, &path), default, &label)?;
                tree::set_path(root, &path, Value::Bool(next))
                    .map_err(|_| StoreError::CannotSetSubfield(label))?;
                Ok((next, true))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Category;
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir) -> JsonBackend {
        let details = ConnectionDetails {
            data_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        JsonBackend::initialize(&details).await.unwrap()
    }

    fn global(ns: &str) -> PathKey {
        PathKey::for_category(ns, "0", Category::Global, 0, false)
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();

        for value in [json!({"a": [1, 2, {"b": null}]}), json!("text"), json!(3.5), json!(null)] {
            let key = global("core").with_identifier("v");
            driver.set(&key, value.clone()).await.unwrap();
            assert_eq!(driver.get(&key).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();
        driver
            .set(&global("core").with_identifier("prefix"), json!(["!"]))
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join("core/settings.json")).unwrap();
        let on_disk: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(on_disk, json!({"0": {"GLOBAL": {"prefix": ["!"]}}}));
    }

    #[tokio::test]
    async fn test_shared_store_is_refcounted() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let a = backend.driver("core", "0").await.unwrap();
        let b = backend.driver("core", "1").await.unwrap();
        assert_eq!(backend.open_files("core"), 2);

        a.set(&global("core").with_identifier("x"), json!(1))
            .await
            .unwrap();
        drop(a);
        assert_eq!(backend.open_files("core"), 1);
        drop(b);
        assert_eq!(backend.open_files("core"), 0);

        let reopened = backend.driver("core", "0").await.unwrap();
        assert_eq!(
            reopened
                .get(&global("core").with_identifier("x"))
                .await
                .unwrap(),
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_get_returns_a_copy() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let key = global("core").with_identifier("list");
        driver.set(&key, json!([1])).await.unwrap();

        let mut copy = driver.get(&key).await.unwrap();
        copy.as_array_mut().unwrap().push(json!(2));
        assert_eq!(driver.get(&key).await.unwrap(), json!([1]));
    }

    #[tokio::test]
    async fn test_cannot_set_inside_scalar() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let key = global("core").with_identifier("n");
        driver.set(&key, json!(5)).await.unwrap();

        let err = driver
            .set(&key.with_identifier("inner"), json!(1))
            .await
            .unwrap_err();
        assert!(err.is_cannot_set_subfield());
        assert_eq!(driver.get(&key).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_iterate_namespaces() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        for (ns, id) in [("core", "0"), ("core", "1"), ("music", "7")] {
            let driver = backend.driver(ns, id).await.unwrap();
            let key = PathKey::for_category(ns, id, Category::Global, 0, false).with_identifier("x");
            driver.set(&key, json!(true)).await.unwrap();
        }

        let mut found: Vec<(String, String)> =
            backend.iterate_namespaces().try_collect().await.unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("core".to_string(), "0".to_string()),
                ("core".to_string(), "1".to_string()),
                ("music".to_string(), "7".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_target_resets_live_files() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let key = global("core").with_identifier("x");
        driver.set(&key, json!(1)).await.unwrap();

        backend.drop_target().await.unwrap();
        assert!(driver.get(&key).await.unwrap_err().is_not_found());
        assert!(!dir.path().join("core/settings.json").exists());
    }

    #[tokio::test]
    async fn test_rejects_foreign_key() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let driver = backend.driver("core", "0").await.unwrap();
        assert!(driver.get(&global("other")).await.is_err());
        assert!(backend.driver("../escape", "0").await.is_err());
    }
}
