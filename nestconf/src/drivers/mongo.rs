//! Document-store driver backed by MongoDB.
//!
//! Each `(namespace, category)` maps to a collection named
//! `"{namespace}.{category}"` (both escaped). A document's `_id` is
//! `{owner_id, primary_key: [..]}` and its remaining fields are the stored
//! document with every key escaped.

use async_stream::try_stream;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, ReplaceOptions, ReturnDocument, UpdateOptions};
use mongodb::{Client, Collection, Database};
use serde_json::{Map, Number, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::backend::BackendKind;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::escape::{escape, escape_keys, unescape, unescape_keys};
use crate::path::{Category, PathKey};
use crate::traits::{ensure_owner, require_document_level, sealed, Driver};
use crate::tree;

/// "Cannot create field ... in element" when writing below a scalar.
const CANNOT_CREATE_FIELD: i32 = 28;
/// Standalone servers reject transactions with `IllegalOperation`.
const ILLEGAL_OPERATION: i32 = 20;

pub(crate) fn mongo_error_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
        ErrorKind::Command(e) => Some(e.code),
        _ => None,
    }
}

fn is_subfield_error(err: &mongodb::error::Error) -> bool {
    mongo_error_code(err) == Some(CANNOT_CREATE_FIELD) || err.to_string().contains("Cannot create field")
}

fn transactions_unsupported(err: &mongodb::error::Error) -> bool {
    mongo_error_code(err) == Some(ILLEGAL_OPERATION)
        || err.to_string().contains("Transaction numbers are only allowed")
}

pub(crate) fn collection_name(namespace: &str, category: &str) -> String {
    format!("{}.{}", escape(namespace), escape(category))
}

/// Split a collection name back into `(namespace, category)`.
pub(crate) fn parse_collection_name(name: &str) -> Option<(String, String)> {
    let (ns, category) = name.split_once('.')?;
    Some((unescape(ns), unescape(category)))
}

/// Escaped, dot-joined field path for `identifiers`.
pub(crate) fn dotted(identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|s| escape(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Field an in-place update targets. Stored documents are objects, so a
/// counter or flag needs at least one identifier.
pub(crate) fn update_field(key: &PathKey) -> Result<String> {
    if key.identifiers().is_empty() {
        return Err(StoreError::InvalidKey(format!(
            "{key}: a whole document cannot be a number or a boolean"
        )));
    }
    Ok(dotted(key.identifiers()))
}

pub(crate) fn document_id(instance_id: &str, primary_key: &[String]) -> Document {
    doc! { "owner_id": instance_id, "primary_key": primary_key.to_vec() }
}

/// Filter matching every document of the owner whose key starts with `prefix`.
pub(crate) fn prefix_filter(instance_id: &str, prefix: &[String]) -> Document {
    let mut filter = doc! { "_id.owner_id": instance_id };
    for (i, part) in prefix.iter().enumerate() {
        filter.insert(format!("_id.primary_key.{i}"), part.as_str());
    }
    filter
}

fn number_to_bson(n: &Number) -> Bson {
    match n.as_i64() {
        Some(i) => Bson::Int64(i),
        None => Bson::Double(n.as_f64().unwrap_or_default()),
    }
}

/// Strip `_id` and decode the stored fields.
fn decode_document(mut document: Document) -> (Vec<String>, Value) {
    let primary_key = match document.remove("_id") {
        Some(Bson::Document(id)) => id
            .get_array("primary_key")
            .map(|parts| {
                parts
                    .iter()
                    .map(|b| match b {
                        Bson::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let value = unescape_keys(Bson::Document(document).into_relaxed_extjson());
    (primary_key, value)
}

fn encode_document(instance_id: &str, primary_key: &[String], value: Value) -> Result<Document> {
    let mut body = bson::to_document(&escape_keys(value))?;
    body.insert("_id", document_id(instance_id, primary_key));
    Ok(body)
}

/// Connection shared by every MongoDB driver.
#[derive(Clone)]
pub struct MongoBackend {
    client: Client,
    db: Database,
}

impl MongoBackend {
    pub async fn initialize(config: &StorageConfig) -> Result<Self> {
        let client = Client::with_uri_str(config.require_url()?).await?;
        let db = client.database(&config.connection.database);
        db.run_command(doc! { "ping": 1 }, None).await?;
        info!(database = %config.connection.database, "Document-store backend ready");
        Ok(Self { client, db })
    }

    pub fn driver(&self, namespace: &str, instance_id: &str) -> MongoDriver {
        MongoDriver {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            backend: self.clone(),
        }
    }

    fn collection(&self, namespace: &str, category: &str) -> Collection<Document> {
        self.db.collection(&collection_name(namespace, category))
    }

    /// Collections of `namespace` as `(category, collection)`.
    async fn namespace_collections(&self, namespace: &str) -> Result<Vec<(String, Collection<Document>)>> {
        let mut out = Vec::new();
        for name in self.db.list_collection_names(None).await? {
            if let Some((ns, category)) = parse_collection_name(&name) {
                if ns == namespace {
                    out.push((category, self.db.collection(&name)));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn iterate_namespaces(&self) -> BoxStream<'static, Result<(String, String)>> {
        let backend = self.clone();
        Box::pin(try_stream! {
            let mut owners = BTreeSet::new();
            for name in backend.db.list_collection_names(None).await? {
                let Some((namespace, _)) = parse_collection_name(&name) else {
                    continue;
                };
                let collection: Collection<Document> = backend.db.collection(&name);
                for owner in collection.distinct("_id.owner_id", None, None).await? {
                    if let Bson::String(instance_id) = owner {
                        owners.insert((namespace.clone(), instance_id));
                    }
                }
            }
            for owner in owners {
                yield owner;
            }
        })
    }

    pub async fn drop_target(&self) -> Result<()> {
        self.db.drop(None).await?;
        info!(database = %self.db.name(), "Dropped database");
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        debug!("Document-store backend closed");
        Ok(())
    }

    /// Replace every document matching `filter` with `documents`, inside a
    /// transaction when the deployment supports one.
    async fn replace_matching(
        &self,
        collection: &Collection<Document>,
        filter: Document,
        documents: Vec<Document>,
    ) -> Result<()> {
        match self
            .replace_in_transaction(collection, filter.clone(), documents.clone())
            .await
        {
            Err(StoreError::Mongo(e)) if transactions_unsupported(&e) => {
                debug!("Transactions unavailable, replacing documents one by one");
                collection.delete_many(filter, None).await?;
                if !documents.is_empty() {
                    collection.insert_many(documents, None).await?;
                }
                Ok(())
            }
            other => other,
        }
    }

    async fn replace_in_transaction(
        &self,
        collection: &Collection<Document>,
        filter: Document,
        documents: Vec<Document>,
    ) -> Result<()> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        collection
            .delete_many_with_session(filter, None, &mut session)
            .await?;
        if !documents.is_empty() {
            collection
                .insert_many_with_session(documents, None, &mut session)
                .await?;
        }
        session.commit_transaction().await?;
        Ok(())
    }
}

/// Document-store driver for one namespace instance.
pub struct MongoDriver {
    namespace: String,
    instance_id: String,
    backend: MongoBackend,
}

impl sealed::Sealed for MongoDriver {}

impl MongoDriver {
    /// Documents of one category whose key starts with `prefix`, nested by
    /// the remaining key parts.
    async fn collect(&self, collection: &Collection<Document>, prefix: &[String]) -> Result<Option<Value>> {
        let mut cursor = collection
            .find(prefix_filter(&self.instance_id, prefix), None)
            .await?;
        let mut out = Map::new();
        let mut found = false;
        while let Some(document) = cursor.try_next().await? {
            let (primary_key, value) = decode_document(document);
            tree::nest_into(&mut out, &primary_key[prefix.len().min(primary_key.len())..], value);
            found = true;
        }
        Ok(found.then_some(Value::Object(out)))
    }

    /// Arity recorded by existing documents in `collection`.
    async fn stored_arity(&self, collection: &Collection<Document>) -> Result<Option<usize>> {
        let sample = collection.find_one(None, None).await?;
        Ok(sample.map(|d| decode_document(d).0.len()))
    }

    fn document_filter(&self, key: &PathKey) -> Document {
        doc! { "_id": document_id(&self.instance_id, key.primary_key()) }
    }

    /// Apply `expr` (computed from the current value at `field`) atomically
    /// and return the stored result.
    async fn apply_pipeline(&self, key: &PathKey, field: String, expr: Document) -> Result<Bson> {
        let category = key.category().map(Category::as_str).unwrap_or_default();
        let collection = self.backend.collection(&self.namespace, category);
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let updated = collection
            .find_one_and_update(
                self.document_filter(key),
                vec![doc! { "$set": { field.clone(): expr } }],
                options,
            )
            .await
            .map_err(|e| {
                if is_subfield_error(&e) {
                    StoreError::CannotSetSubfield(key.to_string())
                } else {
                    StoreError::Mongo(e)
                }
            })?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut current = Bson::Document(updated);
        for part in key.identifiers() {
            current = match current {
                Bson::Document(mut d) => d.remove(escape(part)).unwrap_or(Bson::Null),
                _ => Bson::Null,
            };
        }
        Ok(current)
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::DocumentStore
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        ensure_owner(self, key)?;
        let not_found = || StoreError::NotFound(key.to_string());

        let Some(category) = key.category() else {
            let mut out = Map::new();
            for (category, collection) in self.backend.namespace_collections(&self.namespace).await? {
                let mut cursor = collection.find(prefix_filter(&self.instance_id, &[]), None).await?;
                while let Some(document) = cursor.try_next().await? {
                    let (primary_key, value) = decode_document(document);
                    let mut path = vec![category.clone()];
                    path.extend(primary_key);
                    tree::nest_into(&mut out, &path, value);
                }
            }
            return if out.is_empty() {
                Err(not_found())
            } else {
                Ok(Value::Object(out))
            };
        };

        let collection = self.backend.collection(&self.namespace, category.as_str());
        if key.is_document_level() {
            let document = collection
                .find_one(self.document_filter(key), None)
                .await?
                .ok_or_else(not_found)?;
            let (_, value) = decode_document(document);
            return tree::get_path(&value, key.identifiers())
                .cloned()
                .ok_or_else(not_found);
        }
        self.collect(&collection, key.primary_key())
            .await?
            .ok_or_else(not_found)
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        ensure_owner(self, key)?;

        let Some(category) = key.category() else {
            let Value::Object(categories) = value else {
                return Err(StoreError::InvalidKey(format!(
                    "{key}: a namespace must be set to an object of categories"
                )));
            };
            let mut arities = Vec::new();
            for (name, collection) in self.backend.namespace_collections(&self.namespace).await? {
                arities.push((name, self.stored_arity(&collection).await?));
                collection
                    .delete_many(prefix_filter(&self.instance_id, &[]), None)
                    .await?;
            }
            for (name, data) in categories {
                let arity = arities
                    .iter()
                    .find(|(n, _)| *n == name)
                    .and_then(|(_, a)| *a)
                    .or_else(|| Category::from(name.as_str()).builtin_arity())
                    .ok_or_else(|| StoreError::UnknownCategory(name.clone()))?;
                let documents = tree::split_primary_key(arity, data)?
                    .into_iter()
                    .filter(|(_, doc)| !matches!(doc, Value::Object(m) if m.is_empty()))
                    .map(|(pk, doc)| encode_document(&self.instance_id, &pk, doc))
                    .collect::<Result<Vec<_>>>()?;
                if !documents.is_empty() {
                    self.backend
                        .collection(&self.namespace, &name)
                        .insert_many(documents, None)
                        .await?;
                }
            }
            return Ok(());
        };

        let collection = self.backend.collection(&self.namespace, category.as_str());

        if key.is_document_level() && !key.identifiers().is_empty() {
            let bson_value = bson::to_bson(&escape_keys(value))?;
            let update = doc! { "$set": { dotted(key.identifiers()): bson_value } };
            let options = UpdateOptions::builder().upsert(true).build();
            return match collection
                .update_one(self.document_filter(key), update, options)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_subfield_error(&e) => Err(StoreError::CannotSetSubfield(key.to_string())),
                Err(e) => Err(e.into()),
            };
        }

        if key.is_document_level() {
            match value {
                Value::Object(ref m) if m.is_empty() => {
                    collection.delete_one(self.document_filter(key), None).await?;
                }
                Value::Object(_) => {
                    let document = encode_document(&self.instance_id, key.primary_key(), value)?;
                    let options = ReplaceOptions::builder().upsert(true).build();
                    collection
                        .replace_one(self.document_filter(key), document, options)
                        .await?;
                }
                _ => {
                    return Err(StoreError::InvalidKey(format!(
                        "{key}: a document must be an object"
                    )))
                }
            }
            return Ok(());
        }

        let remaining = key.primary_key_len() - key.primary_key().len();
        let documents = tree::split_primary_key(remaining, value)?
            .into_iter()
            .filter(|(_, doc)| !matches!(doc, Value::Object(m) if m.is_empty()))
            .map(|(rest, doc)| {
                let mut primary_key = key.primary_key().to_vec();
                primary_key.extend(rest);
                encode_document(&self.instance_id, &primary_key, doc)
            })
            .collect::<Result<Vec<_>>>()?;
        self.backend
            .replace_matching(
                &collection,
                prefix_filter(&self.instance_id, key.primary_key()),
                documents,
            )
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn clear(&self, key: &PathKey) -> Result<()> {
        ensure_owner(self, key)?;
        let Some(category) = key.category() else {
            for (_, collection) in self.backend.namespace_collections(&self.namespace).await? {
                collection
                    .delete_many(prefix_filter(&self.instance_id, &[]), None)
                    .await?;
            }
            return Ok(());
        };
        let collection = self.backend.collection(&self.namespace, category.as_str());
        if key.identifiers().is_empty() {
            collection
                .delete_many(prefix_filter(&self.instance_id, key.primary_key()), None)
                .await?;
        } else {
            collection
                .update_one(
                    self.document_filter(key),
                    doc! { "$unset": { dotted(key.identifiers()): "" } },
                    None,
                )
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let field = update_field(key)?;
        let current = format!("${field}");
        let expr = doc! {
            "$cond": [
                { "$in": [ { "$type": current.as_str() }, ["int", "long", "double", "decimal", "missing", "null"] ] },
                { "$add": [ { "$ifNull": [ current.as_str(), number_to_bson(&default) ] }, number_to_bson(&delta) ] },
                current.as_str(),
            ]
        };
        match self.apply_pipeline(key, field, expr).await?.into_relaxed_extjson() {
            Value::Number(n) => Ok(n),
            _ => Err(StoreError::StoredTypeError {
                path: key.to_string(),
                expected: "a number",
            }),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        ensure_owner(self, key)?;
        require_document_level(key)?;
        let field = update_field(key)?;
        let current = format!("${field}");
        let expr = doc! {
            "$cond": [
                { "$in": [ { "$type": current.as_str() }, ["bool", "missing", "null"] ] },
                { "$not": [ { "$ifNull": [ current.as_str(), default ] } ] },
                current.as_str(),
            ]
        };
        match self.apply_pipeline(key, field, expr).await? {
            Bson::Boolean(b) => Ok(b),
            _ => Err(StoreError::StoredTypeError {
                path: key.to_string(),
                expected: "a boolean",
            }),
        }
    }
}
