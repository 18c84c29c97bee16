//! Nested accessor with a default overlay.
//!
//! A [`Config`] binds one driver to one `(namespace, instance_id)` owner and
//! the defaults registered for it. Scope builders ([`Config::global`],
//! [`Config::guild`], ...) return a [`Group`]; groups build further groups and
//! [`Value`]s by name. Nothing touches the driver until a terminal method
//! (`get`, `set`, `clear`, ...) runs.
//!
//! ```no_run
//! use nestconf::{Backend, Config, StorageConfig};
//! use serde_json::json;
//!
//! # async fn example() -> nestconf::Result<()> {
//! let backend = Backend::initialize(&StorageConfig::flat_file("./data")).await?;
//! let config = Config::open(&backend, "core", "0").await?;
//! config.register_global(json!({"prefix": ["!"], "owner": null}))?;
//!
//! let prefix = config.global().value("prefix");
//! assert_eq!(prefix.get().await?, json!(["!"]));
//! prefix.set(json!(["?", "!!"])).await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Number, Value as Json};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

use crate::backend::Backend;
use crate::defaults::Defaults;
use crate::error::{Result, StoreError};
use crate::path::{Category, PathKey};
use crate::traits::Driver;
use crate::tree;

/// Shared handle to a per-key async lock.
pub type KeyLock = Arc<AsyncMutex<()>>;

const LOCK_PRUNE_THRESHOLD: usize = 256;

/// Locks handed out by key; an entry lives as long as someone holds it.
#[derive(Default)]
struct LockCache {
    locks: Mutex<HashMap<PathKey, Weak<AsyncMutex<()>>>>,
}

impl LockCache {
    fn lock_for(&self, key: &PathKey) -> KeyLock {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        if locks.len() >= LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }
}

struct ConfigInner {
    driver: Arc<dyn Driver>,
    defaults: RwLock<Defaults>,
    custom_groups: RwLock<HashMap<String, usize>>,
    locks: LockCache,
    force_registration: AtomicBool,
}

/// Accessor for everything one namespace instance stores.
///
/// Cloning is cheap; clones share defaults, custom groups and locks.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(ConfigInner {
                driver,
                defaults: RwLock::new(Defaults::new()),
                custom_groups: RwLock::new(HashMap::new()),
                locks: LockCache::default(),
                force_registration: AtomicBool::new(false),
            }),
        }
    }

    /// Accessor for `namespace/instance_id` on an initialized backend.
    pub async fn open(backend: &Backend, namespace: &str, instance_id: &str) -> Result<Self> {
        Ok(Self::new(backend.driver(namespace, instance_id).await?))
    }

    /// When set, [`Group::get_attr`] refuses names without registered defaults.
    pub fn set_force_registration(&self, force: bool) {
        self.inner.force_registration.store(force, Ordering::Relaxed);
    }

    pub fn namespace(&self) -> &str {
        self.inner.driver.namespace()
    }

    pub fn instance_id(&self) -> &str {
        self.inner.driver.instance_id()
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    /// Declared custom groups and their primary-key arity.
    pub fn custom_groups(&self) -> HashMap<String, usize> {
        self.inner.custom_groups.read().clone()
    }

    // Defaults registration

    /// Merge `defaults` into the registered defaults of `category`.
    ///
    /// # Errors
    ///
    /// See [`Defaults::register`]. Custom categories must be initialized first.
    pub fn register_defaults(&self, category: &Category, defaults: Json) -> Result<()> {
        if let Category::Custom(name) = category {
            if !self.inner.custom_groups.read().contains_key(name) {
                return Err(StoreError::UnknownCategory(name.clone()));
            }
        }
        self.inner.defaults.write().register(category.as_str(), defaults)?;
        debug!(namespace = self.namespace(), category = %category, "Registered defaults");
        Ok(())
    }

    pub fn register_global(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Global, defaults)
    }

    pub fn register_guild(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Guild, defaults)
    }

    pub fn register_channel(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Channel, defaults)
    }

    pub fn register_role(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Role, defaults)
    }

    pub fn register_user(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::User, defaults)
    }

    pub fn register_member(&self, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Member, defaults)
    }

    pub fn register_custom(&self, group: &str, defaults: Json) -> Result<()> {
        self.register_defaults(&Category::Custom(group.to_string()), defaults)
    }

    /// Declare a custom group taking `arity` primary-key parts.
    ///
    /// # Errors
    ///
    /// `StoreError::InvalidKey` if the name is a built-in category or the
    /// group was already initialized.
    pub fn init_custom(&self, group: &str, arity: usize) -> Result<()> {
        if !Category::from(group).is_custom() {
            return Err(StoreError::InvalidKey(format!(
                "`{group}` is a built-in category"
            )));
        }
        let mut groups = self.inner.custom_groups.write();
        if groups.contains_key(group) {
            return Err(StoreError::InvalidKey(format!(
                "custom group `{group}` is already initialized"
            )));
        }
        groups.insert(group.to_string(), arity);
        Ok(())
    }

    // Scope builders

    /// Group for `category` with a (possibly partial) primary key.
    ///
    /// Below full arity the group has no defaults: it addresses several
    /// documents, not one.
    pub fn scope<I, S>(&self, category: Category, primary_key: I) -> Result<Group>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (pk_len, is_custom) = category.pkey_info(&self.inner.custom_groups.read())?;
        let key = PathKey::for_category(
            self.namespace(),
            self.instance_id(),
            category.clone(),
            pk_len,
            is_custom,
        )
        .with_primary_key(primary_key)?;
        let defaults = if key.is_document_level() {
            self.inner.defaults.read().for_category(category.as_str())
        } else {
            Map::new()
        };
        Ok(Group {
            config: self.clone(),
            key,
            defaults,
        })
    }

    fn builtin_scope(&self, category: Category, primary_key: Vec<String>) -> Group {
        match self.scope(category.clone(), primary_key) {
            Ok(group) => group,
            // Built-in arities are fixed, so only the key shape can be off.
            Err(_) => Group {
                config: self.clone(),
                key: PathKey::for_category(
                    self.namespace(),
                    self.instance_id(),
                    category.clone(),
                    category.builtin_arity().unwrap_or(0),
                    false,
                ),
                defaults: Map::new(),
            },
        }
    }

    pub fn global(&self) -> Group {
        self.builtin_scope(Category::Global, Vec::new())
    }

    pub fn guild(&self, guild_id: impl ToString) -> Group {
        self.builtin_scope(Category::Guild, vec![guild_id.to_string()])
    }

    pub fn channel(&self, channel_id: impl ToString) -> Group {
        self.builtin_scope(Category::Channel, vec![channel_id.to_string()])
    }

    pub fn role(&self, role_id: impl ToString) -> Group {
        self.builtin_scope(Category::Role, vec![role_id.to_string()])
    }

    pub fn user(&self, user_id: impl ToString) -> Group {
        self.builtin_scope(Category::User, vec![user_id.to_string()])
    }

    pub fn member(&self, guild_id: impl ToString, user_id: impl ToString) -> Group {
        self.builtin_scope(
            Category::Member,
            vec![guild_id.to_string(), user_id.to_string()],
        )
    }

    /// Group inside a custom category.
    ///
    /// # Errors
    ///
    /// `StoreError::UnknownCategory` if `group` was never initialized.
    pub fn custom<I, S>(&self, group: &str, primary_key: I) -> Result<Group>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope(Category::Custom(group.to_string()), primary_key)
    }

    /// Global value `name`, the common single-setting case.
    pub fn value(&self, name: &str) -> Value {
        self.global().value(name)
    }

    // Locks

    pub fn lock_for(&self, key: &PathKey) -> KeyLock {
        self.inner.locks.lock_for(key)
    }

    /// Lock shared by everything that coordinates on a whole category.
    pub fn scope_lock(&self, category: &Category) -> Result<KeyLock> {
        Ok(self.lock_for(self.scope(category.clone(), Vec::<String>::new())?.key()))
    }

    /// Lock for the members of one guild, or for all members.
    pub fn member_lock(&self, guild_id: Option<&str>) -> Result<KeyLock> {
        let group = self.scope(Category::Member, guild_id)?;
        Ok(self.lock_for(group.key()))
    }

    // Scope enumeration

    /// Every document under `category`, with defaults mixed in, keyed by
    /// primary key (nested one level per primary-key part).
    pub async fn all_from_scope(&self, category: &Category) -> Result<Map<String, Json>> {
        let group = self.scope(category.clone(), Vec::<String>::new())?;
        self.collect_documents(&group).await
    }

    async fn collect_documents(&self, group: &Group) -> Result<Map<String, Json>> {
        let key = group.key();
        let depth = key.primary_key_len() - key.primary_key().len();
        let raw = match self.inner.driver.get(key).await {
            Ok(Json::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) if e.is_not_found() => return Ok(Map::new()),
            Err(e) => return Err(e),
        };
        let category = key.category().map(Category::as_str).unwrap_or_default();
        let defaults = Json::Object(self.inner.defaults.read().for_category(category));
        if depth == 0 {
            return match tree::nested_update(&defaults, Json::Object(raw)) {
                Json::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            };
        }
        Ok(mix_defaults(raw, depth, &defaults))
    }

    pub async fn all_guilds(&self) -> Result<Map<String, Json>> {
        self.all_from_scope(&Category::Guild).await
    }

    pub async fn all_channels(&self) -> Result<Map<String, Json>> {
        self.all_from_scope(&Category::Channel).await
    }

    pub async fn all_roles(&self) -> Result<Map<String, Json>> {
        self.all_from_scope(&Category::Role).await
    }

    pub async fn all_users(&self) -> Result<Map<String, Json>> {
        self.all_from_scope(&Category::User).await
    }

    /// Members of one guild keyed by user id, or of every guild keyed by
    /// guild id then user id.
    pub async fn all_members(&self, guild_id: Option<&str>) -> Result<Map<String, Json>> {
        let group = self.scope(Category::Member, guild_id)?;
        self.collect_documents(&group).await
    }

    // Clearing

    /// Remove everything this namespace instance stores.
    #[instrument(skip(self), fields(namespace = self.namespace()))]
    pub async fn clear_all(&self) -> Result<()> {
        self.inner
            .driver
            .clear(&PathKey::for_namespace(self.namespace(), self.instance_id()))
            .await
    }

    async fn clear_scope(&self, group: Group) -> Result<()> {
        self.inner.driver.clear(group.key()).await
    }

    pub async fn clear_all_globals(&self) -> Result<()> {
        self.clear_scope(self.global()).await
    }

    pub async fn clear_all_guilds(&self) -> Result<()> {
        self.clear_scope(self.scope(Category::Guild, Vec::<String>::new())?).await
    }

    pub async fn clear_all_channels(&self) -> Result<()> {
        self.clear_scope(self.scope(Category::Channel, Vec::<String>::new())?).await
    }

    pub async fn clear_all_roles(&self) -> Result<()> {
        self.clear_scope(self.scope(Category::Role, Vec::<String>::new())?).await
    }

    pub async fn clear_all_users(&self) -> Result<()> {
        self.clear_scope(self.scope(Category::User, Vec::<String>::new())?).await
    }

    pub async fn clear_all_members(&self, guild_id: Option<&str>) -> Result<()> {
        self.clear_scope(self.scope(Category::Member, guild_id)?).await
    }

    pub async fn clear_all_custom(&self, group: &str) -> Result<()> {
        self.clear_scope(self.custom(group, Vec::<String>::new())?).await
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace())
            .field("instance_id", &self.instance_id())
            .field("backend", &self.inner.driver.backend())
            .field("custom_groups", &*self.inner.custom_groups.read())
            .finish()
    }
}

/// Overlay `defaults` on each document found `depth` (at least 1) levels
/// below `data`.
fn mix_defaults(data: Map<String, Json>, depth: usize, defaults: &Json) -> Map<String, Json> {
    data.into_iter()
        .map(|(k, v)| {
            let mixed = match (depth, v) {
                (0 | 1, v) => tree::nested_update(defaults, v),
                (_, Json::Object(children)) => Json::Object(mix_defaults(children, depth - 1, defaults)),
                (_, other) => other,
            };
            (k, mixed)
        })
        .collect()
}

/// What a name resolves to under a [`Group`].
#[derive(Debug, Clone)]
pub enum Attr {
    Group(Group),
    Value(Value),
}

/// A location holding a map of further groups and values.
#[derive(Clone)]
pub struct Group {
    config: Config,
    key: PathKey,
    defaults: Map<String, Json>,
}

impl Group {
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    /// Registered defaults for this group.
    pub fn defaults(&self) -> &Map<String, Json> {
        &self.defaults
    }

    fn descend(&self, name: &str) -> PathKey {
        if self.key.is_document_level() {
            self.key.with_identifier(name)
        } else {
            // Still inside the primary key: names are ids.
            self.key
                .with_primary_key([name])
                .unwrap_or_else(|_| self.key.with_identifier(name))
        }
    }

    /// Subgroup `name`; defaults come from the registered group of that name.
    pub fn group(&self, name: &str) -> Group {
        let key = self.descend(name);
        let defaults = match self.defaults.get(name) {
            Some(Json::Object(map)) => map.clone(),
            _ if key.is_document_level() && key.identifiers().is_empty() => {
                let category = key.category().map(Category::as_str).unwrap_or_default();
                self.config.inner.defaults.read().for_category(category)
            }
            _ => Map::new(),
        };
        Group {
            config: self.config.clone(),
            key,
            defaults,
        }
    }

    /// Value `name`; its default is the registered one, or `null`.
    pub fn value(&self, name: &str) -> Value {
        Value {
            config: self.config.clone(),
            key: self.descend(name),
            default: self.defaults.get(name).cloned().unwrap_or(Json::Null),
        }
    }

    /// Resolve `name` the way its defaults were registered.
    ///
    /// # Errors
    ///
    /// `StoreError::InvalidKey` for an unregistered name when registration is
    /// forced.
    pub fn get_attr(&self, name: &str) -> Result<Attr> {
        match self.defaults.get(name) {
            Some(Json::Object(_)) => Ok(Attr::Group(self.group(name))),
            Some(_) => Ok(Attr::Value(self.value(name))),
            None if self.config.inner.force_registration.load(Ordering::Relaxed) => {
                Err(StoreError::InvalidKey(format!(
                    "`{name}` is not registered under {}",
                    self.key
                )))
            }
            None => Ok(Attr::Value(self.value(name))),
        }
    }

    pub fn is_group(&self, name: &str) -> bool {
        matches!(self.defaults.get(name), Some(Json::Object(_)))
    }

    pub fn is_value(&self, name: &str) -> bool {
        matches!(self.defaults.get(name), Some(v) if !v.is_object())
    }

    /// Stored data overlaid on the defaults.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn get(&self) -> Result<Json> {
        let defaults = Json::Object(self.defaults.clone());
        match self.config.inner.driver.get(&self.key).await {
            Ok(stored) => Ok(tree::nested_update(&defaults, stored)),
            Err(e) if e.is_not_found() => Ok(defaults),
            Err(e) => Err(e),
        }
    }

    /// [`Group::get`] as a map.
    ///
    /// # Errors
    ///
    /// `StoreError::NotAContainer` if a scalar is stored here.
    pub async fn all(&self) -> Result<Map<String, Json>> {
        match self.get().await? {
            Json::Object(map) => Ok(map),
            _ => Err(StoreError::NotAContainer(self.key.to_string())),
        }
    }

    /// Replace the whole group.
    pub async fn set(&self, map: Map<String, Json>) -> Result<()> {
        self.config.inner.driver.set(&self.key, Json::Object(map)).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.config.inner.driver.clear(&self.key).await
    }

    fn raw_key<S: AsRef<str>>(&self, path: &[S]) -> PathKey {
        path.iter()
            .fold(self.key.clone(), |key, part| {
                if key.is_document_level() {
                    key.with_identifier(part.as_ref())
                } else {
                    key.with_primary_key([part.as_ref()])
                        .unwrap_or_else(|_| key.with_identifier(part.as_ref()))
                }
            })
    }

    /// Read `path` below this group, falling back to registered defaults.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if nothing is stored and no default is
    /// registered along `path`.
    pub async fn get_raw<S: AsRef<str>>(&self, path: &[S]) -> Result<Json> {
        let default = tree::get_path(&Json::Object(self.defaults.clone()), path).cloned();
        self.read_raw(path, default).await
    }

    /// [`Group::get_raw`] with an explicit fallback.
    pub async fn get_raw_or<S: AsRef<str>>(&self, path: &[S], default: Json) -> Result<Json> {
        self.read_raw(path, Some(default)).await
    }

    async fn read_raw<S: AsRef<str>>(&self, path: &[S], default: Option<Json>) -> Result<Json> {
        match (self.config.inner.driver.get(&self.raw_key(path)).await, default) {
            (Ok(stored), Some(default @ Json::Object(_))) => Ok(tree::nested_update(&default, stored)),
            (Ok(stored), _) => Ok(stored),
            (Err(e), Some(default)) if e.is_not_found() => Ok(default),
            (Err(e), _) => Err(e),
        }
    }

    pub async fn set_raw<S: AsRef<str>>(&self, path: &[S], value: Json) -> Result<()> {
        self.config.inner.driver.set(&self.raw_key(path), value).await
    }

    pub async fn clear_raw<S: AsRef<str>>(&self, path: &[S]) -> Result<()> {
        self.config.inner.driver.clear(&self.raw_key(path)).await
    }

    pub fn lock(&self) -> KeyLock {
        self.config.lock_for(&self.key)
    }

    /// Edit the group in place under its lock.
    ///
    /// `f` sees the stored data overlaid on defaults. The result is written
    /// back once `f` returns, and only if it changed.
    pub async fn edit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Map<String, Json>) -> R,
    {
        let lock = self.lock();
        let _guard = lock.lock().await;
        let mut working = self.all().await?;
        let original = working.clone();
        let out = f(&mut working);
        if working != original {
            self.set(working).await?;
        }
        Ok(out)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("key", &self.key)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// A single stored setting.
#[derive(Clone)]
pub struct Value {
    config: Config,
    key: PathKey,
    default: Json,
}

impl Value {
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    pub fn default_value(&self) -> &Json {
        &self.default
    }

    /// The stored value, or the registered default.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn get(&self) -> Result<Json> {
        self.get_or(self.default.clone()).await
    }

    /// The stored value, or `default` if nothing is stored.
    pub async fn get_or(&self, default: Json) -> Result<Json> {
        match self.config.inner.driver.get(&self.key).await {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_not_found() => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub async fn set(&self, value: Json) -> Result<()> {
        self.config.inner.driver.set(&self.key, value).await
    }

    /// Remove the stored value; reads return the default again.
    pub async fn clear(&self) -> Result<()> {
        self.config.inner.driver.clear(&self.key).await
    }

    /// Add `delta`, starting from the registered default (or 0).
    pub async fn increment(&self, delta: impl Into<Number>) -> Result<Number> {
        let default = match &self.default {
            Json::Number(n) => n.clone(),
            _ => Number::from(0),
        };
        self.config
            .inner
            .driver
            .increment(&self.key, delta.into(), default)
            .await
    }

    /// Flip the stored boolean, starting from the registered default (or false).
    pub async fn toggle(&self) -> Result<bool> {
        let default = self.default.as_bool().unwrap_or(false);
        self.config.inner.driver.toggle(&self.key, default).await
    }

    pub fn lock(&self) -> KeyLock {
        self.config.lock_for(&self.key)
    }

    /// Edit a list or map value in place under its lock.
    ///
    /// The result is written back once `f` returns, and only if it changed.
    ///
    /// # Errors
    ///
    /// `StoreError::NotAContainer` if the current value is not an array or
    /// an object.
    pub async fn edit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Json) -> R,
    {
        let lock = self.lock();
        let _guard = lock.lock().await;
        let mut working = self.get().await?;
        if !(working.is_array() || working.is_object()) {
            return Err(StoreError::NotAContainer(self.key.to_string()));
        }
        let original = working.clone();
        let out = f(&mut working);
        if working != original {
            self.set(working).await?;
        }
        Ok(out)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("key", &self.key)
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionDetails;
    use crate::drivers::json::JsonBackend;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (Config, TempDir) {
        let dir = TempDir::new().unwrap();
        let details = ConnectionDetails {
            data_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let backend = JsonBackend::initialize(&details).await.unwrap();
        let driver = backend.driver("core", "0").await.unwrap();
        (Config::new(Arc::new(driver)), dir)
    }

    #[tokio::test]
    async fn test_group_overlays_defaults() {
        let (config, _dir) = setup().await;
        config
            .register_guild(json!({"toggles": {"a": true, "b": false}, "name": "none"}))
            .unwrap();
        let guild = config.guild(42);
        guild.group("toggles").value("b").set(json!(true)).await.unwrap();

        assert_eq!(
            guild.get().await.unwrap(),
            json!({"toggles": {"a": true, "b": true}, "name": "none"})
        );
        assert_eq!(config.guild(7).value("name").get().await.unwrap(), json!("none"));
    }

    #[tokio::test]
    async fn test_get_attr_follows_registration() {
        let (config, _dir) = setup().await;
        config.register_global(json!({"limits__daily": 5, "owner": null})).unwrap();
        let global = config.global();

        assert!(matches!(global.get_attr("limits").unwrap(), Attr::Group(_)));
        assert!(matches!(global.get_attr("owner").unwrap(), Attr::Value(_)));
        assert!(matches!(global.get_attr("other").unwrap(), Attr::Value(_)));

        config.set_force_registration(true);
        assert!(global.get_attr("other").is_err());
    }

    #[tokio::test]
    async fn test_raw_paths() {
        let (config, _dir) = setup().await;
        config.register_global(json!({"a": {"b": {"c": 1, "d": 2}}})).unwrap();
        let global = config.global();

        global.set_raw(&["a", "b", "c"], json!(10)).await.unwrap();
        assert_eq!(global.get_raw(&["a", "b"]).await.unwrap(), json!({"c": 10, "d": 2}));
        assert_eq!(global.get_raw(&["a", "b", "d"]).await.unwrap(), json!(2));
        assert!(global.get_raw(&["x"]).await.unwrap_err().is_not_found());
        assert_eq!(global.get_raw_or(&["x"], json!("fallback")).await.unwrap(), json!("fallback"));

        global.clear_raw(&["a", "b", "c"]).await.unwrap();
        assert_eq!(global.get_raw(&["a", "b", "c"]).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_value_edit_writes_back() {
        let (config, _dir) = setup().await;
        config.register_global(json!({"list": [], "count": 0})).unwrap();

        let list = config.value("list");
        let len = list
            .edit(|v| {
                if let Some(items) = v.as_array_mut() {
                    items.push(json!("x"));
                }
                v.as_array().map(Vec::len)
            })
            .await
            .unwrap();
        assert_eq!(len, Some(1));
        assert_eq!(list.get().await.unwrap(), json!(["x"]));

        let err = config.value("count").edit(|_| ()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotAContainer(_)));
    }

    #[tokio::test]
    async fn test_unchanged_edit_does_not_write() {
        let (config, _dir) = setup().await;
        config.register_global(json!({"list": [1]})).unwrap();
        config.value("list").edit(|_| ()).await.unwrap();
        assert!(config
            .driver()
            .get(config.value("list").key())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_locks_are_shared_per_key() {
        let (config, _dir) = setup().await;
        let a = config.value("x").lock();
        let b = config.clone().value("x").lock();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &config.value("y").lock()));

        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);
    }

    #[tokio::test]
    async fn test_custom_groups() {
        let (config, _dir) = setup().await;
        assert!(matches!(
            config.custom("tags", ["a"]),
            Err(StoreError::UnknownCategory(_))
        ));
        config.init_custom("tags", 2).unwrap();
        assert!(config.init_custom("tags", 2).is_err());
        assert!(config.init_custom("GUILD", 1).is_err());
        config.register_custom("tags", json!({"weight": 1})).unwrap();

        let doc = config.custom("tags", ["a", "b"]).unwrap();
        assert_eq!(doc.value("weight").get().await.unwrap(), json!(1));
        assert!(config.custom("tags", ["a"]).unwrap().defaults().is_empty());
        assert!(config.custom("tags", ["a", "b", "c"]).is_err());
    }

    #[tokio::test]
    async fn test_all_members_and_clearing() {
        let (config, _dir) = setup().await;
        config.register_member(json!({"xp": 0, "rank": "new"})).unwrap();
        config.member(1, 10).value("xp").set(json!(5)).await.unwrap();
        config.member(1, 11).value("rank").set(json!("old")).await.unwrap();
        config.member(2, 10).value("xp").set(json!(1)).await.unwrap();

        let guild_one = config.all_members(Some("1")).await.unwrap();
        assert_eq!(guild_one["10"], json!({"xp": 5, "rank": "new"}));
        assert_eq!(guild_one["11"], json!({"xp": 0, "rank": "old"}));

        let all = config.all_members(None).await.unwrap();
        assert_eq!(all["2"]["10"], json!({"xp": 1, "rank": "new"}));

        config.clear_all_members(Some("1")).await.unwrap();
        assert!(config.all_members(Some("1")).await.unwrap().is_empty());
        assert_eq!(config.all_members(None).await.unwrap().len(), 1);

        config.clear_all().await.unwrap();
        assert!(config.all_members(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_scope_builds_documents() {
        let (config, _dir) = setup().await;
        config.register_member(json!({"xp": 0})).unwrap();
        let guild_members = config.scope(Category::Member, ["5"]).unwrap();
        assert!(guild_members.defaults().is_empty());

        let member = guild_members.group("6");
        assert_eq!(member.key().primary_key(), ["5", "6"]);
        assert_eq!(member.value("xp").get().await.unwrap(), json!(0));
    }
}
