//! Sharded hash-bucket driver.
//!
//! Documents are spread over a fixed number of MessagePack bucket files at
//! `{data_path}/{namespace}/{instance_id}/{n}.bin`. A document's bucket is
//! `xxh32(category, primary_key) % bucket_count`, recomputed on every access
//! and never stored. Buckets load lazily; a write re-serializes only the
//! buckets it touched.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use xxhash_rust::xxh32::xxh32;

use crate::backend::BackendKind;
use crate::config::ConnectionDetails;
use crate::durable;
use crate::error::{Result, StoreError};
use crate::path::{Category, PathKey};
use crate::registry::{Lease, SharedRegistry};
use crate::traits::{ensure_owner, require_document_level, sealed, validate_owner_name, Driver};
use crate::tree;

/// One stored document with the address it was written under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    category: String,
    primary_key: Vec<String>,
    document: Value,
}

type Bucket = BTreeMap<String, Entry>;

/// Id of a document address. Each part carries its byte length, so distinct
/// addresses never share an id.
fn entry_id(category: &str, primary_key: &[String]) -> String {
    let mut id = String::new();
    for part in std::iter::once(category).chain(primary_key.iter().map(String::as_str)) {
        id.push_str(&part.len().to_string());
        id.push(':');
        id.push_str(part);
    }
    id
}

/// Bucket index for a document address.
pub fn bucket_for(category: &str, primary_key: &[String], bucket_count: u32) -> u32 {
    xxh32(entry_id(category, primary_key).as_bytes(), 0) % bucket_count.max(1)
}

/// All buckets of one namespace instance.
pub(crate) struct BucketStore {
    dir: PathBuf,
    bucket_count: u32,
    loaded: RwLock<HashMap<u32, Arc<Bucket>>>,
    write_lock: Arc<Mutex<()>>,
}

impl BucketStore {
    async fn open(dir: PathBuf, bucket_count: u32) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        let sweep_dir = dir.clone();
        let swept =
            tokio::task::spawn_blocking(move || durable::sweep_temp_files(&sweep_dir)).await??;
        if swept > 0 {
            info!(dir = %dir.display(), swept, "Removed temp files from an interrupted write");
        }
        Ok(Self {
            dir,
            bucket_count: bucket_count.max(1),
            loaded: RwLock::new(HashMap::new()),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn bucket_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{index}.bin"))
    }

    /// Load bucket `index`, reading it from disk on first use.
    async fn bucket(&self, index: u32) -> Result<Arc<Bucket>> {
        let cached = self.loaded.read().get(&index).cloned();
        if let Some(bucket) = cached {
            return Ok(bucket);
        }
        let bucket: Bucket = match fs::read(self.bucket_path(index)).await {
            Ok(bytes) => rmp_serde::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Bucket::new(),
            Err(e) => return Err(e.into()),
        };
        let mut loaded = self.loaded.write();
        let bucket = loaded.entry(index).or_insert_with(|| Arc::new(bucket));
        Ok(Arc::clone(bucket))
    }

    async fn all_entries(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for index in 0..self.bucket_count {
            out.extend(self.bucket(index).await?.values().cloned());
        }
        Ok(out)
    }

    async fn document(&self, category: &str, primary_key: &[String]) -> Result<Option<Value>> {
        let bucket = self
            .bucket(bucket_for(category, primary_key, self.bucket_count))
            .await?;
        Ok(bucket
            .get(&entry_id(category, primary_key))
            .map(|entry| entry.document.clone()))
    }

    /// Run `f` against copies of the buckets in `scope` under the write lock,
    /// then persist and publish the buckets it marked dirty.
    ///
    /// The whole write runs on a spawned task holding the lock, so an
    /// abandoned caller cannot leave memory and disk out of step.
    async fn write<T, F>(self: Arc<Self>, scope: Scope, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkingSet<'_>) -> Result<T> + Send + 'static,
    {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut working = WorkingSet {
                store: &self,
                buckets: HashMap::new(),
                dirty: BTreeSet::new(),
            };
            working.load(scope).await?;
            let out = f(&mut working)?;
            let WorkingSet { buckets, dirty, .. } = working;
            let mut written = Vec::with_capacity(dirty.len());
            for index in dirty {
                let Some(bucket) = buckets.get(&index).cloned() else {
                    continue;
                };
                let path = self.bucket_path(index);
                let bucket = Arc::new(bucket);
                let encoded = Arc::clone(&bucket);
                tokio::task::spawn_blocking(move || {
                    let bytes = rmp_serde::to_vec_named(&*encoded)?;
                    durable::write_atomic(&path, &bytes)
                })
                .await??;
                written.push((index, bucket));
            }
            let count = written.len();
            let mut loaded = self.loaded.write();
            for (index, bucket) in written {
                loaded.insert(index, bucket);
            }
            debug!(dir = %self.dir.display(), buckets = count, "Persisted dirty buckets");
            Ok(out)
        });
        task.await?
    }

    async fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir).await?;
        self.loaded.write().clear();
        Ok(())
    }
}

/// Mutable copies of the buckets a write touches.
struct WorkingSet<'a> {
    store: &'a BucketStore,
    buckets: HashMap<u32, Bucket>,
    dirty: BTreeSet<u32>,
}

/// Buckets a write needs to see.
#[derive(Debug, Clone, Copy)]
enum Scope {
    /// The single bucket holding one document
    One(u32),
    /// Every bucket, for writes above document level
    All,
}

impl WorkingSet<'_> {
    async fn load(&mut self, scope: Scope) -> Result<()> {
        let indices = match scope {
            Scope::One(index) => index..index + 1,
            Scope::All => 0..self.store.bucket_count,
        };
        for index in indices {
            let bucket = self.store.bucket(index).await?;
            self.buckets.insert(index, (*bucket).clone());
        }
        Ok(())
    }

    fn get(&self, category: &str, primary_key: &[String]) -> Option<&Value> {
        let index = bucket_for(category, primary_key, self.store.bucket_count);
        self.buckets
            .get(&index)?
            .get(&entry_id(category, primary_key))
            .map(|e| &e.document)
    }

    fn insert(&mut self, category: &str, primary_key: Vec<String>, document: Value) {
        let index = bucket_for(category, &primary_key, self.store.bucket_count);
        let id = entry_id(category, &primary_key);
        self.buckets.entry(index).or_default().insert(
            id,
            Entry {
                category: category.to_string(),
                primary_key,
                document,
            },
        );
        self.dirty.insert(index);
    }

    /// Primary-key length of each category present in the loaded buckets.
    fn stored_arities(&self) -> HashMap<String, usize> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.values())
            .map(|e| (e.category.clone(), e.primary_key.len()))
            .collect()
    }

    /// Remove every entry whose address starts with `(category, prefix)`.
    /// `None` matches every category.
    fn remove_matching(&mut self, category: Option<&str>, prefix: &[String]) -> usize {
        let mut removed = 0;
        for (index, bucket) in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|_, e| !entry_matches(e, category, prefix));
            if bucket.len() != before {
                removed += before - bucket.len();
                self.dirty.insert(*index);
            }
        }
        removed
    }
}

fn entry_matches(entry: &Entry, category: Option<&str>, prefix: &[String]) -> bool {
    category.map_or(true, |c| entry.category == c) && entry.primary_key.starts_with(prefix)
}

/// Process-wide state of the hash-bucket backend.
#[derive(Clone)]
pub struct SplitFilesBackend {
    base: PathBuf,
    bucket_count: u32,
    stores: Arc<SharedRegistry<BucketStore>>,
}

impl SplitFilesBackend {
    pub async fn initialize(details: &ConnectionDetails) -> Result<Self> {
        fs::create_dir_all(&details.data_path).await?;
        info!(
            path = %details.data_path.display(),
            buckets = details.bucket_count,
            "Hash-bucket backend ready"
        );
        Ok(Self {
            base: details.data_path.clone(),
            bucket_count: details.bucket_count.max(1),
            stores: SharedRegistry::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub async fn driver(&self, namespace: &str, instance_id: &str) -> Result<SplitFilesDriver> {
        validate_owner_name(namespace)?;
        validate_owner_name(instance_id)?;
        let dir = self.base.join(namespace).join(instance_id);
        let count = self.bucket_count;
        let store = self
            .stores
            .acquire(&format!("{namespace}/{instance_id}"), || {
                BucketStore::open(dir, count)
            })
            .await?;
        Ok(SplitFilesDriver {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            store,
        })
    }

    /// Every `{namespace}/{instance_id}` directory holding at least one bucket file.
    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        let base = self.base.clone();
        Box::pin(try_stream! {
            let mut namespaces = match fs::read_dir(&base).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => Err::<fs::ReadDir, StoreError>(e.into())?,
            };
            while let Some(ns_entry) = namespaces.next_entry().await? {
                if !ns_entry.file_type().await?.is_dir() {
                    continue;
                }
                let namespace = ns_entry.file_name().to_string_lossy().into_owned();
                let mut instances = fs::read_dir(ns_entry.path()).await?;
                while let Some(inst_entry) = instances.next_entry().await? {
                    if !inst_entry.file_type().await?.is_dir() {
                        continue;
                    }
                    if has_bucket_files(&inst_entry.path()).await? {
                        let instance_id = inst_entry.file_name().to_string_lossy().into_owned();
                        yield (namespace.clone(), instance_id);
                    }
                }
            }
        })
    }

    pub async fn drop_target(&self) -> Result<()> {
        for (name, live) in self.stores.live() {
            debug!(store = %name, "Resetting live bucket store");
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
}

async fn has_bucket_files(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().ends_with(".bin") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Hash-bucket driver for one namespace instance.
pub struct SplitFilesDriver {
    namespace: String,
    instance_id: String,
    store: Lease<BucketStore>,
}

impl sealed::Sealed for SplitFilesDriver {}

impl SplitFilesDriver {
    fn scope_for(&self, key: &PathKey) -> Scope {
        match key.category() {
            Some(category) if key.is_document_level() => Scope::One(bucket_for(
                category.as_str(),
                key.primary_key(),
                self.store.bucket_count,
            )),
            _ => Scope::All,
        }
    }

    /// Rebuild the nested tree above document level from matching entries.
    async fn collect(&self, key: &PathKey) -> Result<Value> {
        let category = key.category().map(Category::as_str);
        let prefix = key.primary_key();
        let mut out = Map::new();
        for entry in self.store.all_entries().await? {
            if !entry_matches(&entry, category, prefix) {
                continue;
            }
            let mut path = Vec::new();
            if category.is_none() {
                path.push(entry.category.clone());
            }
            path.extend(entry.primary_key[prefix.len()..].iter().cloned());
            tree::nest_into(&mut out, &path, entry.document);
        }
        if out.is_empty() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(Value::Object(out))
    }
}

/// Arity of a category seen in a whole-namespace write: what is already
/// stored for it, then the built-in arity.
fn category_arity(name: &str, stored: &HashMap<String, usize>) -> Result<usize> {
    stored
        .get(name)
        .copied()
        .or_else(|| Category::from(name).builtin_arity())
        .ok_or_else(|| StoreError::UnknownCategory(name.to_string()))
}

#[async_trait]
impl Driver for SplitFilesDriver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::HashBucket
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        ensure_owner(self, key)?;
        if !key.is_document_level() {
            return self.collect(key).await;
        }
        let category = key.category().map(Category::as_str).unwrap_or_default();
        let document = self
            .store
            .document(category, key.primary_key())
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        tree::get_path(&document, key.identifiers())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        ensure_owner(self, key)?;
        let key = key.clone();
        let scope = self.scope_for(&key);
        self.store
            .shared()
            .write(scope, move |ws| {
                let Some(category) = key.category().map(Category::as_str) else {
                    let Value::Object(categories) = value else {
                        return Err(StoreError::InvalidKey(format!(
                            "{key}: a namespace must be set to an object of categories"
                        )));
                    };
                    let stored = ws.stored_arities();
                    ws.remove_matching(None, &[]);
                    for (name, data) in categories {
                        let arity = category_arity(&name, &stored)?;
                        for (pk, doc) in tree::split_primary_key(arity, data)? {
                            ws.insert(&name, pk, doc);
                        }
                    }
                    return Ok(());
                };

                if key.is_document_level() {
                    let pk = key.primary_key().to_vec();
                    let mut document = ws.get(category, &pk).cloned().unwrap_or(Value::Null);
                    if key.identifiers().is_empty() {
                        document = value;
                    } else {
                        if document.is_null() {
                            document = Value::Object(Map::new());
                        }
                        tree::set_path(&mut document, key.identifiers(), value)
                            .map_err(|_| StoreError::CannotSetSubfield(key.to_string()))?;
                    }
                    ws.insert(category, pk, document);
                    return Ok(());
                }

                let prefix = key.primary_key().to_vec();
                let remaining = key.primary_key_len() - prefix.len();
                let documents = tree::split_primary_key(remaining, value)?;
                ws.remove_matching(Some(category), &prefix);
                for (rest, doc) in documents {
                    let mut pk = prefix.clone();
                    pk.extend(rest);
                    ws.insert(category, pk, doc);
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn clear(&self, key: &PathKey) -> Result<()> {
        ensure_owner(self, key)?;
        let key = key.clone();
        let scope = self.scope_for(&key);
        self.store
            .shared()
            .write(scope, move |ws| {
                let category = key.category().map(Category::as_str);
                if !key.is_document_level() || key.identifiers().is_empty() {
                    ws.remove_matching(category, key.primary_key());
                    return Ok(());
                }
                let category = category.unwrap_or_default();
                let pk = key.primary_key().to_vec();
                if let Some(mut document) = ws.get(category, &pk).cloned() {
                    if tree::clear_path(&mut document, key.identifiers()) {
                        ws.insert(category, pk, document);
                    }
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let key = key.clone();
        let scope = self.scope_for(&key);
        self.store
            .shared()
            .write(scope, move |ws| {
                let category = key.category().map(Category::as_str).unwrap_or_default();
                let pk = key.primary_key().to_vec();
                let mut document = ws.get(category, &pk).cloned().unwrap_or(Value::Null);
                let label = key.to_string();
                let next = tree::incremented(
                    tree::get_path(&document, key.identifiers()),
                    &delta,
                    &default,
                    &label,
                )?;
                if key.identifiers().is_empty() {
                    document = Value::Number(next.clone());
                } else {
                    if document.is_null() {
                        document = Value::Object(Map::new());
                    }
                    tree::set_path(&mut document, key.identifiers(), Value::Number(next.clone()))
                        .map_err(|_| StoreError::CannotSetSubfield(label))?;
                }
                ws.insert(category, pk, document);
                Ok(next)
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let key = key.clone();
        let scope = self.scope_for(&key);
        self.store
            .shared()
            .write(scope, move |ws| {
                let category = key.category().map(Category::as_str).unwrap_or_default();
                let pk = key.primary_key().to_vec();
                let mut document = ws.get(category, &pk).cloned().unwrap_or(Value::Null);
                let label = key.to_string();
                let next = tree::toggled(tree::get_path(&document, key.identifiers()), default, &label)?;
                if key.identifiers().is_empty() {
                    document = Value::Bool(next);
                } else {
                    if document.is_null() {
                        document = Value::Object(Map::new());
                    }
                    tree::set_path(&mut document, key.identifiers(), Value::Bool(next))
                        .map_err(|_| StoreError::CannotSetSubfield(label))?;
                }
                ws.insert(category, pk, document);
                Ok(next)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir, buckets: u32) -> SplitFilesBackend {
        let details = ConnectionDetails {
            data_path: dir.path().to_path_buf(),
            bucket_count: buckets,
            ..Default::default()
        };
        SplitFilesBackend::initialize(&details).await.unwrap()
    }

    fn member(ns: &str) -> PathKey {
        PathKey::for_category(ns, "0", Category::Member, 2, false)
    }

    #[test]
    fn test_bucket_assignment_is_stable() {
        let pk = vec!["1".to_string(), "2".to_string()];
        let a = bucket_for("MEMBER", &pk, 16);
        let b = bucket_for("MEMBER", &pk, 16);
        assert_eq!(a, b);
        assert!(a < 16);
        assert_eq!(bucket_for("GLOBAL", &[], 1), 0);
    }

    #[tokio::test]
    async fn test_document_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 8).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let key = member("core").with_primary_key(["10", "20"]).unwrap();

        driver.set(&key, json!({"nick": "x", "xp": 3})).await.unwrap();
        assert_eq!(driver.get(&key.with_identifier("nick")).await.unwrap(), json!("x"));
        assert_eq!(
            driver.get(&member("core")).await.unwrap(),
            json!({"10": {"20": {"nick": "x", "xp": 3}}})
        );
    }

    #[tokio::test]
    async fn test_only_touched_buckets_written() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 32).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let key = member("core").with_primary_key(["1", "2"]).unwrap();
        driver.set(&key, json!({"a": 1})).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("core/0"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        let expected = format!(
            "{}.bin",
            bucket_for("MEMBER", &["1".to_string(), "2".to_string()], 32)
        );
        assert_eq!(files, vec![expected]);
    }

    #[tokio::test]
    async fn test_partial_set_replaces_children() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 4).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let guild = member("core").with_primary_key(["1"]).unwrap();

        driver
            .set(&guild, json!({"2": {"a": 1}, "3": {"b": 2}}))
            .await
            .unwrap();
        driver.set(&guild, json!({"3": {"c": 3}})).await.unwrap();

        assert_eq!(driver.get(&guild).await.unwrap(), json!({"3": {"c": 3}}));
    }

    #[tokio::test]
    async fn test_clear_levels() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 4).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let doc = member("core").with_primary_key(["1", "2"]).unwrap();
        driver.set(&doc, json!({"a": 1, "b": 2})).await.unwrap();

        driver.clear(&doc.with_identifier("a")).await.unwrap();
        assert_eq!(driver.get(&doc).await.unwrap(), json!({"b": 2}));

        driver.clear(&member("core")).await.unwrap();
        driver.clear(&member("core")).await.unwrap();
        assert!(driver.get(&doc).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let key = PathKey::for_category("core", "0", Category::Global, 0, false).with_identifier("n");
        {
            let backend = backend(&dir, 8).await;
            let driver = backend.driver("core", "0").await.unwrap();
            assert_eq!(
                driver.increment(&key, Number::from(5), Number::from(0)).await.unwrap(),
                Number::from(5)
            );
        }
        let backend = backend(&dir, 8).await;
        let driver = backend.driver("core", "0").await.unwrap();
        assert_eq!(driver.get(&key).await.unwrap(), json!(5));

        let found: Vec<(String, String)> = backend.iterate_namespaces().try_collect().await.unwrap();
        assert_eq!(found, vec![("core".to_string(), "0".to_string())]);
    }

    #[test]
    fn test_entry_ids_do_not_collide() {
        let a = vec!["x\u{1f}y".to_string(), "z".to_string()];
        let b = vec!["x".to_string(), "y\u{1f}z".to_string()];
        assert_ne!(entry_id("tags", &a), entry_id("tags", &b));
        assert_ne!(entry_id("ab", &[]), entry_id("a", &["b".to_string()]));
    }

    #[tokio::test]
    async fn test_separator_keys_are_distinct_documents() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 1).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let tags = PathKey::for_category("core", "0", Category::Custom("tags".into()), 2, true);
        let first = tags.with_primary_key(["x\u{1f}y", "z"]).unwrap();
        let second = tags.with_primary_key(["x", "y\u{1f}z"]).unwrap();

        driver.set(&first, json!({"who": "a"})).await.unwrap();
        driver.set(&second, json!({"who": "b"})).await.unwrap();

        assert_eq!(driver.get(&first).await.unwrap(), json!({"who": "a"}));
        assert_eq!(driver.get(&second).await.unwrap(), json!({"who": "b"}));
    }

    #[tokio::test]
    async fn test_namespace_set_accepts_its_own_read() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, 4).await;
        let driver = backend.driver("core", "0").await.unwrap();
        let tags = PathKey::for_category("core", "0", Category::Custom("tags".into()), 1, true);
        driver
            .set(&tags.with_primary_key(["a"]).unwrap(), json!({"w": 1}))
            .await
            .unwrap();
        driver
            .set(&member("core").with_primary_key(["1", "2"]).unwrap(), json!({"xp": 3}))
            .await
            .unwrap();

        let root = PathKey::for_namespace("core", "0");
        let snapshot = driver.get(&root).await.unwrap();
        assert_eq!(
            snapshot,
            json!({"tags": {"a": {"w": 1}}, "MEMBER": {"1": {"2": {"xp": 3}}}})
        );
        driver.set(&root, snapshot.clone()).await.unwrap();
        assert_eq!(driver.get(&root).await.unwrap(), snapshot);
        assert_eq!(
            driver.get(&tags.with_primary_key(["a"]).unwrap()).await.unwrap(),
            json!({"w": 1})
        );

        let err = driver
            .set(&root, json!({"unseen": {"k": {"v": 1}}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCategory(name) if name == "unseen"));
    }
}
