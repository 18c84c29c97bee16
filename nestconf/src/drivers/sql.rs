//! Relational driver backed by SQLite.
//!
//! Every `(namespace, instance_id, category)` gets its own table named
//! `"{namespace}.{instance_id}.{category}"` with one `TEXT` column per
//! primary-key part and a `json_data` column holding the document. Global data uses a single
//! primary-key column fixed at `0`.
//!
//! Nested reads and writes happen inside the database through SQL functions
//! registered on the connection (`nestconf_get`, `nestconf_set`,
//! `nestconf_clear`, `nestconf_inc`, `nestconf_toggle`). They receive the
//! identifier path as a JSON array and signal misuse with recognizable
//! messages that the driver turns back into typed errors.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

use crate::backend::BackendKind;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::path::{Category, PathKey};
use crate::traits::{ensure_owner, require_document_level, sealed, Driver};
use crate::tree;

const ASSIGNMENT_SIGNAL: &str = "error in assignment";
const TYPE_SIGNAL: &str = "wrong object type";

/// Errors raised from inside the registered SQL functions.
#[derive(Debug, thiserror::Error)]
enum Signal {
    #[error("error in assignment: cannot set a field inside a non-object value")]
    Assignment,
    #[error("wrong object type: expected {0}")]
    WrongType(&'static str),
    #[error("invalid JSON argument: {0}")]
    BadJson(#[from] serde_json::Error),
}

fn signal(s: Signal) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(s))
}

fn json_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    match ctx.get::<Option<String>>(idx)? {
        Some(text) => Ok(Some(
            serde_json::from_str(&text).map_err(|e| signal(Signal::BadJson(e)))?,
        )),
        None => Ok(None),
    }
}

fn path_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = ctx.get(idx)?;
    serde_json::from_str(&text).map_err(|e| signal(Signal::BadJson(e)))
}

fn document_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Value> {
    Ok(json_arg(ctx, idx)?.unwrap_or_else(|| Value::Object(Map::new())))
}

fn number_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Number> {
    match json_arg(ctx, idx)? {
        Some(Value::Number(n)) => Ok(n),
        _ => Err(signal(Signal::WrongType("a number"))),
    }
}

fn type_signal(err: StoreError) -> rusqlite::Error {
    match err {
        StoreError::StoredTypeError { expected, .. } => signal(Signal::WrongType(expected)),
        _ => signal(Signal::Assignment),
    }
}

/// Register the document procedures on `conn`.
fn register_procedures(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    // nestconf_get(doc, path) -> json | NULL
    conn.create_scalar_function("nestconf_get", 2, flags, |ctx| {
        let Some(doc) = json_arg(ctx, 0)? else {
            return Ok(None);
        };
        let path = path_arg(ctx, 1)?;
        Ok(tree::get_path(&doc, &path).map(Value::to_string))
    })?;

    // nestconf_set(doc, path, value) -> json
    conn.create_scalar_function("nestconf_set", 3, flags, |ctx| {
        let mut doc = document_arg(ctx, 0)?;
        let path = path_arg(ctx, 1)?;
        let value = json_arg(ctx, 2)?.unwrap_or(Value::Null);
        tree::set_path(&mut doc, &path, value).map_err(|_| signal(Signal::Assignment))?;
        Ok(doc.to_string())
    })?;

    // nestconf_clear(doc, path) -> json | NULL
    conn.create_scalar_function("nestconf_clear", 2, flags, |ctx| {
        let Some(mut doc) = json_arg(ctx, 0)? else {
            return Ok(None);
        };
        let path = path_arg(ctx, 1)?;
        tree::clear_path(&mut doc, &path);
        Ok(Some(doc.to_string()))
    })?;

    // nestconf_inc(doc, path, delta, default) -> json
    conn.create_scalar_function("nestconf_inc", 4, flags, |ctx| {
        let mut doc = json_arg(ctx, 0)?.unwrap_or(Value::Null);
        let path = path_arg(ctx, 1)?;
        let delta = number_arg(ctx, 2)?;
        let default = number_arg(ctx, 3)?;
        let next = tree::incremented(tree::get_path(&doc, &path), &delta, &default, &"")
            .map_err(type_signal)?;
        if !path.is_empty() && doc.is_null() {
            doc = Value::Object(Map::new());
        }
        tree::set_path(&mut doc, &path, Value::Number(next))
            .map_err(|_| signal(Signal::Assignment))?;
        Ok(doc.to_string())
    })?;

    // nestconf_toggle(doc, path, default) -> json
    conn.create_scalar_function("nestconf_toggle", 3, flags, |ctx| {
        let mut doc = json_arg(ctx, 0)?.unwrap_or(Value::Null);
        let path = path_arg(ctx, 1)?;
        let default = matches!(json_arg(ctx, 2)?, Some(Value::Bool(true)));
        let next = tree::toggled(tree::get_path(&doc, &path), default, &"").map_err(type_signal)?;
        if !path.is_empty() && doc.is_null() {
            doc = Value::Object(Map::new());
        }
        tree::set_path(&mut doc, &path, Value::Bool(next))
            .map_err(|_| signal(Signal::Assignment))?;
        Ok(doc.to_string())
    })?;

    Ok(())
}

/// Turn a failed statement back into the store's error taxonomy.
fn translate(err: rusqlite::Error, key: &PathKey, expected: &'static str) -> StoreError {
    let message = err.to_string();
    if message.contains(ASSIGNMENT_SIGNAL) {
        StoreError::CannotSetSubfield(key.to_string())
    } else if message.contains(TYPE_SIGNAL) {
        StoreError::StoredTypeError {
            path: key.to_string(),
            expected,
        }
    } else {
        StoreError::Sqlite(err)
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn pk_columns(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("primary_key_{i}")).collect()
}

fn where_prefix(len: usize) -> String {
    if len == 0 {
        return "1 = 1".to_string();
    }
    (1..=len)
        .map(|i| format!("primary_key_{i} = ?{i}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn value_to_key(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Null => String::new(),
    }
}

/// Metadata row describing one category table.
#[derive(Debug, Clone)]
struct TableInfo {
    category: String,
    name: String,
    primary_key_len: usize,
}

impl TableInfo {
    fn columns(&self) -> usize {
        self.primary_key_len.max(1)
    }
}

fn lookup_table(
    conn: &Connection,
    namespace: &str,
    instance_id: &str,
    category: &str,
) -> Result<Option<TableInfo>> {
    let found = conn
        .query_row(
            "SELECT table_name, primary_key_len FROM nestconf_tables
             WHERE namespace = ?1 AND instance_id = ?2 AND category = ?3",
            params![namespace, instance_id, category],
            |row| {
                Ok(TableInfo {
                    category: category.to_string(),
                    name: row.get(0)?,
                    primary_key_len: row.get::<_, i64>(1)? as usize,
                })
            },
        )
        .optional()?;
    Ok(found)
}

fn owner_tables(conn: &Connection, namespace: &str, instance_id: &str) -> Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare(
        "SELECT category, table_name, primary_key_len FROM nestconf_tables
         WHERE namespace = ?1 AND instance_id = ?2 ORDER BY category",
    )?;
    let rows = stmt.query_map(params![namespace, instance_id], |row| {
        Ok(TableInfo {
            category: row.get(0)?,
            name: row.get(1)?,
            primary_key_len: row.get::<_, i64>(2)? as usize,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn ensure_table(
    conn: &Connection,
    namespace: &str,
    instance_id: &str,
    category: &str,
    primary_key_len: usize,
    is_custom: bool,
) -> Result<TableInfo> {
    if let Some(info) = lookup_table(conn, namespace, instance_id, category)? {
        return Ok(info);
    }
    let info = TableInfo {
        category: category.to_string(),
        name: format!("{namespace}.{instance_id}.{category}"),
        primary_key_len,
    };
    let columns = pk_columns(info.columns());
    let column_defs: Vec<String> = columns.iter().map(|c| format!("{c} TEXT NOT NULL")).collect();
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, json_data TEXT NOT NULL, PRIMARY KEY ({}))",
        quote(&info.name),
        column_defs.join(", "),
        columns.join(", ")
    );
    trace!(%ddl, "Creating category table");
    conn.execute(&ddl, [])?;
    conn.execute(
        "INSERT OR IGNORE INTO nestconf_namespaces (namespace, instance_id) VALUES (?1, ?2)",
        params![namespace, instance_id],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO nestconf_tables
         (namespace, instance_id, category, table_name, primary_key_len, is_custom)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            namespace,
            instance_id,
            category,
            info.name,
            primary_key_len as i64,
            is_custom
        ],
    )?;
    debug!(table = %info.name, "Created category table");
    Ok(info)
}

fn drop_table(conn: &Connection, namespace: &str, instance_id: &str, info: &TableInfo) -> Result<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote(&info.name)), [])?;
    conn.execute(
        "DELETE FROM nestconf_tables WHERE namespace = ?1 AND instance_id = ?2 AND category = ?3",
        params![namespace, instance_id, info.category],
    )?;
    Ok(())
}

fn drop_owner(conn: &Connection, namespace: &str, instance_id: &str) -> Result<()> {
    for info in owner_tables(conn, namespace, instance_id)? {
        drop_table(conn, namespace, instance_id, &info)?;
    }
    conn.execute(
        "DELETE FROM nestconf_namespaces WHERE namespace = ?1 AND instance_id = ?2",
        params![namespace, instance_id],
    )?;
    Ok(())
}

/// Rows of `info` whose primary key starts with `prefix`, nested by the
/// remaining key parts.
fn collect_rows(conn: &Connection, info: &TableInfo, prefix: &[String]) -> Result<Map<String, Value>> {
    let columns = pk_columns(info.columns());
    let sql = format!(
        "SELECT {}, json_data FROM {} WHERE {}",
        columns.join(", "),
        quote(&info.name),
        where_prefix(prefix.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(prefix.iter()))?;
    let mut out = Map::new();
    while let Some(row) = rows.next()? {
        let mut path = Vec::with_capacity(columns.len());
        for i in 0..info.primary_key_len {
            path.push(value_to_key(row.get_ref(i)?));
        }
        let text: String = row.get(columns.len())?;
        let doc: Value = serde_json::from_str(&text)?;
        tree::nest_into(&mut out, &path[prefix.len().min(path.len())..], doc);
    }
    Ok(out)
}

/// The one document of a category without primary keys.
fn single_document(conn: &Connection, info: &TableInfo) -> Result<Option<Value>> {
    let sql = format!("SELECT json_data FROM {} LIMIT 1", quote(&info.name));
    let text: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn insert_document(conn: &Connection, info: &TableInfo, primary_key: &[String], doc: &Value) -> Result<()> {
    let columns = pk_columns(info.columns());
    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}, json_data) VALUES ({})",
        quote(&info.name),
        columns.join(", "),
        placeholders.join(", ")
    );
    let mut args = stored_primary_key(info.primary_key_len, primary_key);
    args.push(doc.to_string());
    conn.execute(&sql, params_from_iter(args.iter()))?;
    Ok(())
}

/// Primary key as stored: global data lives under a fixed `0`.
fn stored_primary_key(primary_key_len: usize, primary_key: &[String]) -> Vec<String> {
    if primary_key_len == 0 {
        vec!["0".to_string()]
    } else {
        primary_key.to_vec()
    }
}

/// Shared connection of the relational backend.
#[derive(Clone)]
pub struct SqlBackend {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqlBackend {
    /// Open the database, register procedures and create metadata tables.
    pub async fn initialize(config: &StorageConfig) -> Result<Self> {
        let url = config.require_url()?.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = if url == ":memory:" {
                let conn = Connection::open_in_memory()?;
                conn.execute_batch("PRAGMA temp_store=MEMORY;")?;
                conn
            } else {
                if let Some(parent) = Path::new(&url).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&url)?;
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA cache_size=-64000;
                     PRAGMA temp_store=MEMORY;",
                )?;
                conn
            };
            register_procedures(&conn)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS nestconf_namespaces (
                    namespace   TEXT NOT NULL,
                    instance_id TEXT NOT NULL,
                    PRIMARY KEY (namespace, instance_id)
                );
                CREATE TABLE IF NOT EXISTS nestconf_tables (
                    namespace       TEXT NOT NULL,
                    instance_id     TEXT NOT NULL,
                    category        TEXT NOT NULL,
                    table_name      TEXT NOT NULL,
                    primary_key_len INTEGER NOT NULL,
                    is_custom       INTEGER NOT NULL,
                    PRIMARY KEY (namespace, instance_id, category)
                );
                "#,
            )?;
            Ok(conn)
        })
        .await??;
        info!("Relational backend ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` on the blocking pool with the shared connection.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| StoreError::Backend("relational backend is torn down".to_string()))?;
            f(conn)
        })
        .await?
    }

    pub fn driver(&self, namespace: &str, instance_id: &str) -> SqlDriver {
        SqlDriver {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            backend: self.clone(),
        }
    }

    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        let backend = self.clone();
        Box::pin(try_stream! {
            let owners = backend
                .run(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT namespace, instance_id FROM nestconf_namespaces
                         ORDER BY namespace, instance_id",
                    )?;
                    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                    Ok(rows.collect::<rusqlite::Result<Vec<(String, String)>>>()?)
                })
                .await?;
            for owner in owners {
                yield owner;
            }
        })
    }

    /// Drop every category table and all metadata.
    pub async fn drop_target(&self) -> Result<()> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let names: Vec<String> = {
                let mut stmt = tx.prepare("SELECT table_name FROM nestconf_tables")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for name in &names {
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote(name)), [])?;
            }
            tx.execute_batch("DELETE FROM nestconf_tables; DELETE FROM nestconf_namespaces;")?;
            tx.commit()?;
            info!(tables = names.len(), "Dropped all category tables");
            Ok(())
        })
        .await
    }

    /// Close the shared connection. Safe to call more than once.
    pub async fn teardown(&self) -> Result<()> {
        if self.conn.lock().take().is_some() {
            info!("Closed relational backend connection");
        }
        Ok(())
    }
}

/// Relational driver for one namespace instance.
pub struct SqlDriver {
    namespace: String,
    instance_id: String,
    backend: SqlBackend,
}

impl sealed::Sealed for SqlDriver {}

impl SqlDriver {
    fn owner(&self) -> (String, String) {
        (self.namespace.clone(), self.instance_id.clone())
    }
}

fn path_json(key: &PathKey) -> String {
    Value::from(key.identifiers().to_vec()).to_string()
}

/// Table, primary-key column list and stored key for a document-level write.
fn document_target(
    conn: &Connection,
    ns: &str,
    id: &str,
    key: &PathKey,
    category: &str,
) -> Result<(TableInfo, Vec<String>, Vec<String>)> {
    let info = ensure_table(conn, ns, id, category, key.primary_key_len(), key.is_custom())?;
    let columns = pk_columns(info.columns());
    let pk = stored_primary_key(key.primary_key_len(), key.primary_key());
    Ok((info, columns, pk))
}

#[async_trait]
impl Driver for SqlDriver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Relational
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        ensure_owner(self, key)?;
        let (ns, id) = self.owner();
        let key = key.clone();
        self.backend
            .run(move |conn| {
                let not_found = || StoreError::NotFound(key.to_string());
                let Some(category) = key.category() else {
                    let mut out = Map::new();
                    for info in owner_tables(conn, &ns, &id)? {
                        if info.primary_key_len == 0 {
                            if let Some(doc) = single_document(conn, &info)? {
                                out.insert(info.category.clone(), doc);
                            }
                            continue;
                        }
                        let rows = collect_rows(conn, &info, &[])?;
                        if !rows.is_empty() {
                            out.insert(info.category.clone(), Value::Object(rows));
                        }
                    }
                    return if out.is_empty() {
                        Err(not_found())
                    } else {
                        Ok(Value::Object(out))
                    };
                };
                let Some(info) = lookup_table(conn, &ns, &id, category.as_str())? else {
                    return Err(not_found());
                };

                if key.is_document_level() {
                    let pk = stored_primary_key(info.primary_key_len, key.primary_key());
                    let sql = format!(
                        "SELECT nestconf_get(json_data, ?{}) FROM {} WHERE {}",
                        pk.len() + 1,
                        quote(&info.name),
                        where_prefix(pk.len())
                    );
                    let mut args = pk;
                    args.push(path_json(&key));
                    let found: Option<Option<String>> = conn
                        .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
                        .optional()?;
                    let text = found.flatten().ok_or_else(not_found)?;
                    return Ok(serde_json::from_str(&text)?);
                }

                let rows = collect_rows(conn, &info, key.primary_key())?;
                if rows.is_empty() {
                    Err(not_found())
                } else {
                    Ok(Value::Object(rows))
                }
            })
            .await
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        ensure_owner(self, key)?;
        let (ns, id) = self.owner();
        let key = key.clone();
        self.backend
            .run(move |conn| {
                let Some(category) = key.category().map(Category::as_str) else {
                    let Value::Object(categories) = value else {
                        return Err(StoreError::InvalidKey(format!(
                            "{key}: a namespace must be set to an object of categories"
                        )));
                    };
                    let tx = conn.transaction()?;
                    let known = owner_tables(&tx, &ns, &id)?;
                    drop_owner(&tx, &ns, &id)?;
                    for (name, data) in categories {
                        let parsed = Category::from(name.as_str());
                        let arity = known
                            .iter()
                            .find(|t| t.category == name)
                            .map(|t| t.primary_key_len)
                            .or_else(|| parsed.builtin_arity())
                            .ok_or_else(|| StoreError::UnknownCategory(name.clone()))?;
                        let info = ensure_table(&tx, &ns, &id, &name, arity, parsed.is_custom())?;
                        for (pk, doc) in tree::split_primary_key(arity, data)? {
                            insert_document(&tx, &info, &pk, &doc)?;
                        }
                    }
                    tx.commit()?;
                    return Ok(());
                };

                if key.is_document_level() {
                    let (info, columns, pk) = document_target(conn, &ns, &id, &key, category)?;
                    let n = pk.len();
                    let sql = format!(
                        "INSERT INTO {table} ({cols}, json_data) VALUES ({vals}, nestconf_set(NULL, ?{p}, ?{v}))
                         ON CONFLICT ({cols}) DO UPDATE SET json_data = nestconf_set(json_data, ?{p}, ?{v})",
                        table = quote(&info.name),
                        cols = columns.join(", "),
                        vals = (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
                        p = n + 1,
                        v = n + 2,
                    );
                    let mut args = pk;
                    args.push(path_json(&key));
                    args.push(value.to_string());
                    conn.execute(&sql, params_from_iter(args.iter()))
                        .map_err(|e| translate(e, &key, "an object"))?;
                    return Ok(());
                }

                let prefix = key.primary_key().to_vec();
                let remaining = key.primary_key_len() - prefix.len();
                let documents = tree::split_primary_key(remaining, value)?;
                let tx = conn.transaction()?;
                let info = ensure_table(
                    &tx,
                    &ns,
                    &id,
                    category,
                    key.primary_key_len(),
                    key.is_custom(),
                )?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE {}", quote(&info.name), where_prefix(prefix.len())),
                    params_from_iter(prefix.iter()),
                )?;
                for (rest, doc) in documents {
                    let mut pk = prefix.clone();
                    pk.extend(rest);
                    insert_document(&tx, &info, &pk, &doc)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn clear(&self, key: &PathKey) -> Result<()> {
        ensure_owner(self, key)?;
        let (ns, id) = self.owner();
        let key = key.clone();
        self.backend
            .run(move |conn| {
                let Some(category) = key.category() else {
                    let tx = conn.transaction()?;
                    drop_owner(&tx, &ns, &id)?;
                    tx.commit()?;
                    return Ok(());
                };
                let Some(info) = lookup_table(conn, &ns, &id, category.as_str())? else {
                    return Ok(());
                };
                if key.primary_key().is_empty() && key.identifiers().is_empty() {
                    return drop_table(conn, &ns, &id, &info);
                }
                let pk = if key.is_document_level() {
                    stored_primary_key(info.primary_key_len, key.primary_key())
                } else {
                    key.primary_key().to_vec()
                };
                if key.identifiers().is_empty() {
                    conn.execute(
                        &format!("DELETE FROM {} WHERE {}", quote(&info.name), where_prefix(pk.len())),
                        params_from_iter(pk.iter()),
                    )?;
                } else {
                    let sql = format!(
                        "UPDATE {} SET json_data = nestconf_clear(json_data, ?{}) WHERE {}",
                        quote(&info.name),
                        pk.len() + 1,
                        where_prefix(pk.len())
                    );
                    let mut args = pk;
                    args.push(path_json(&key));
                    conn.execute(&sql, params_from_iter(args.iter()))?;
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let (ns, id) = self.owner();
        let key = key.clone();
        self.backend
            .run(move |conn| {
                let category = key.category().map(Category::as_str).unwrap_or_default();
                let (info, columns, pk) = document_target(conn, &ns, &id, &key, category)?;
                let n = pk.len();
                let sql = format!(
                    "INSERT INTO {table} ({cols}, json_data) VALUES ({vals}, nestconf_inc(NULL, ?{p}, ?{d}, ?{f}))
                     ON CONFLICT ({cols}) DO UPDATE SET json_data = nestconf_inc(json_data, ?{p}, ?{d}, ?{f})
                     RETURNING nestconf_get(json_data, ?{p})",
                    table = quote(&info.name),
                    cols = columns.join(", "),
                    vals = (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
                    p = n + 1,
                    d = n + 2,
                    f = n + 3,
                );
                let mut args = pk;
                args.push(path_json(&key));
                args.push(delta.to_string());
                args.push(default.to_string());
                let text: String = conn
                    .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
                    .map_err(|e| translate(e, &key, "a number"))?;
                match serde_json::from_str(&text)? {
                    Value::Number(n) => Ok(n),
                    _ => Err(StoreError::StoredTypeError {
                        path: key.to_string(),
                        expected: "a number",
                    }),
                }
            })
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let (ns, id) = self.owner();
        let key = key.clone();
        self.backend
            .run(move |conn| {
                let category = key.category().map(Category::as_str).unwrap_or_default();
                let (info, columns, pk) = document_target(conn, &ns, &id, &key, category)?;
                let n = pk.len();
                let sql = format!(
                    "INSERT INTO {table} ({cols}, json_data) VALUES ({vals}, nestconf_toggle(NULL, ?{p}, ?{f}))
                     ON CONFLICT ({cols}) DO UPDATE SET json_data = nestconf_toggle(json_data, ?{p}, ?{f})
                     RETURNING nestconf_get(json_data, ?{p})",
                    table = quote(&info.name),
                    cols = columns.join(", "),
                    vals = (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
                    p = n + 1,
                    f = n + 2,
                );
                let mut args = pk;
                args.push(path_json(&key));
                args.push(Value::Bool(default).to_string());
                let text: String = conn
                    .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
                    .map_err(|e| translate(e, &key, "a boolean"))?;
                match serde_json::from_str(&text)? {
                    Value::Bool(b) => Ok(b),
                    _ => Err(StoreError::StoredTypeError {
                        path: key.to_string(),
                        expected: "a boolean",
                    }),
                }
            })
            .await
    }
}
