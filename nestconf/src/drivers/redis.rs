//! Key-path driver backed by Redis with the RedisJSON module.
//!
//! Each namespace is one JSON document stored at `nestconf:{namespace}` and
//! shaped `{instance_id: {category: {pk...: document}}}`. Every object key is
//! written as `k` followed by the hex of its UTF-8 bytes, so arbitrary
//! identifiers are safe inside a JSONPath.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::backend::BackendKind;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::path::PathKey;
use crate::traits::{ensure_owner, require_document_level, sealed, Driver};
use crate::tree;

const KEY_PREFIX: &str = "nestconf:";

pub(crate) fn redis_key(namespace: &str) -> String {
    format!("{KEY_PREFIX}{namespace}")
}

/// Encode one path segment or object key.
pub(crate) fn encode_segment(name: &str) -> String {
    format!("k{}", hex::encode(name.as_bytes()))
}

pub(crate) fn decode_segment(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded.strip_prefix('k')?).ok()?;
    String::from_utf8(bytes).ok()
}

/// JSONPath addressing `segments` from the document root.
pub(crate) fn json_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        path.push('.');
        path.push_str(&encode_segment(segment.as_ref()));
    }
    path
}

pub(crate) fn encode_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (encode_segment(&k), encode_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(encode_keys).collect()),
        other => other,
    }
}

pub(crate) fn decode_keys(value: Value) -> Result<Value> {
    Ok(match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let name = decode_segment(&k)
                    .ok_or_else(|| StoreError::Backend(format!("malformed stored key `{k}`")))?;
                out.insert(name, decode_keys(v)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(decode_keys)
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other,
    })
}

/// Connection and per-namespace write locks of the key-path backend.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RedisBackend {
    pub async fn initialize(config: &StorageConfig) -> Result<Self> {
        let client = redis::Client::open(config.require_url()?)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Key-path backend ready");
        Ok(Self {
            conn,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn driver(&self, namespace: &str, instance_id: &str) -> RedisDriver {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        RedisDriver {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            key: redis_key(namespace),
            conn: self.conn.clone(),
            lock,
        }
    }

    async fn namespace_keys(conn: &mut MultiplexedConnection) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        let mut conn = self.conn.clone();
        Box::pin(try_stream! {
            for key in Self::namespace_keys(&mut conn).await? {
                let Some(namespace) = key.strip_prefix(KEY_PREFIX).map(str::to_string) else {
                    continue;
                };
                let encoded: Option<Vec<String>> = redis::cmd("JSON.OBJKEYS")
                    .arg(&key)
                    .arg(".")
                    .query_async(&mut conn)
                    .await?;
                let mut instances: Vec<String> = encoded
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|k| decode_segment(k))
                    .collect();
                instances.sort();
                for instance_id in instances {
                    yield (namespace.clone(), instance_id);
                }
            }
        })
    }

    pub async fn drop_target(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys = Self::namespace_keys(&mut conn).await?;
        if !keys.is_empty() {
            let _: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        }
        info!(keys = keys.len(), "Dropped namespace documents");
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        debug!("Key-path backend closed");
        Ok(())
    }
}

/// Key-path driver for one namespace instance.
pub struct RedisDriver {
    namespace: String,
    instance_id: String,
    key: String,
    conn: MultiplexedConnection,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl sealed::Sealed for RedisDriver {}

impl RedisDriver {
    fn full_path(&self, key: &PathKey) -> Vec<String> {
        std::iter::once(self.instance_id.clone())
            .chain(key.segments().into_iter().map(str::to_string))
            .collect()
    }

    /// Stored value at `path`, or `None` if the path does not resolve.
    async fn read(&self, path: &[String]) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(&self.key)
            .arg(json_path(path))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let matches: Vec<Value> = serde_json::from_str(&raw)?;
        match matches.into_iter().next() {
            Some(found) => Ok(Some(decode_keys(found)?)),
            None => Ok(None),
        }
    }

    /// Create every missing object above `path`. Must run under `self.lock`.
    async fn ensure_parents(&self, path: &[String], label: &PathKey) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: Option<String> = redis::cmd("JSON.SET")
            .arg(&self.key)
            .arg("$")
            .arg("{}")
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        for depth in 1..path.len() {
            let parent = json_path(&path[..depth]);
            let _: Option<String> = redis::cmd("JSON.SET")
                .arg(&self.key)
                .arg(&parent)
                .arg("{}")
                .arg("NX")
                .query_async(&mut conn)
                .await?;
            let kinds: Vec<String> = redis::cmd("JSON.TYPE")
                .arg(&self.key)
                .arg(&parent)
                .query_async(&mut conn)
                .await?;
            if kinds.first().map(String::as_str) != Some("object") {
                return Err(StoreError::CannotSetSubfield(label.to_string()));
            }
        }
        Ok(())
    }

    async fn write(&self, path: &[String], value: Value, label: &PathKey) -> Result<()> {
        self.ensure_parents(path, label).await?;
        let mut conn = self.conn.clone();
        let _: Option<String> = redis::cmd("JSON.SET")
            .arg(&self.key)
            .arg(json_path(path))
            .arg(encode_keys(value).to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::KeyPath
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        ensure_owner(self, key)?;
        match self.read(&self.full_path(key)).await? {
            Some(Value::Object(m)) if m.is_empty() => Err(StoreError::NotFound(key.to_string())),
            Some(value) => Ok(value),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        ensure_owner(self, key)?;
        let _guard = self.lock.lock().await;
        self.write(&self.full_path(key), value, key).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn clear(&self, key: &PathKey) -> Result<()> {
        ensure_owner(self, key)?;
        let _guard = self.lock.lock().await;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("JSON.DEL")
            .arg(&self.key)
            .arg(json_path(&self.full_path(key)))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let _guard = self.lock.lock().await;
        let path = self.full_path(key);
        let current = self.read(&path).await?;
        let next = tree::incremented(current.as_ref(), &delta, &default, key)?;
        self.write(&path, Value::Number(next.clone()), key).await?;
        Ok(next)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let _guard = self.lock.lock().await;
        let path = self.full_path(key);
        let current = self.read(&path).await?;
        let next = tree::toggled(current.as_ref(), default, key)?;
        self.write(&path, Value::Bool(next), key).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Category;
    use futures::TryStreamExt;
    use serde_json::json;

    #[test]
    fn test_segment_codec() {
        assert_eq!(encode_segment("a.b"), "k612e62");
        assert_eq!(decode_segment("k612e62").as_deref(), Some("a.b"));
        assert_eq!(decode_segment("612e62"), None);
        assert_eq!(encode_segment(""), "k");
        assert_eq!(decode_segment("k").as_deref(), Some(""));
    }

    #[test]
    fn test_json_path() {
        assert_eq!(json_path::<&str>(&[]), "$");
        assert_eq!(json_path(&["0", "GLOBAL"]), "$.k30.k474c4f42414c");
    }

    #[test]
    fn test_key_codec_nested() {
        let doc = json!({"a": {"$b": [{"c.d": true}]}});
        let encoded = encode_keys(doc.clone());
        assert!(encoded.get("k61").is_some());
        assert_eq!(decode_keys(encoded).unwrap(), doc);
    }

    async fn live_backend() -> Option<RedisBackend> {
        let url = std::env::var("NESTCONF_TEST_REDIS_URL").ok()?;
        let mut config = StorageConfig::default();
        config.backend = BackendKind::KeyPath;
        config.connection.url = Some(url);
        Some(RedisBackend::initialize(&config).await.unwrap())
    }

    #[tokio::test]
    #[ignore = "requires NESTCONF_TEST_REDIS_URL with RedisJSON"]
    async fn test_live_round_trip() {
        let backend = live_backend().await.unwrap();
        let ns = format!("test-{}", uuid::Uuid::new_v4().simple());
        let driver = backend.driver(&ns, "0");
        let global = PathKey::for_category(ns.as_str(), "0", Category::Global, 0, false);

        driver.set(&global.with_identifiers(["a", "b"]), json!(1)).await.unwrap();
        assert_eq!(driver.get(&global).await.unwrap(), json!({"a": {"b": 1}}));
        assert!(driver
            .set(&global.with_identifiers(["a", "b", "c"]), json!(2))
            .await
            .unwrap_err()
            .is_cannot_set_subfield());

        let counter = global.with_identifier("count");
        driver.increment(&counter, Number::from(5), Number::from(0)).await.unwrap();
        let n = driver.increment(&counter, Number::from(-2), Number::from(0)).await.unwrap();
        assert_eq!(n, Number::from(3));

        driver.clear(&global.with_identifier("a")).await.unwrap();
        driver.clear(&global.with_identifier("count")).await.unwrap();
        assert!(driver.get(&global).await.unwrap_err().is_not_found());

        let owners: Vec<(String, String)> = backend.iterate_namespaces().try_collect().await.unwrap();
        assert!(owners.contains(&(ns.clone(), "0".to_string())));

        driver.clear(&PathKey::for_namespace(ns.as_str(), "0")).await.unwrap();
    }
}
