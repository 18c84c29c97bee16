//! Core driver trait definitions.
//!
//! The `Driver` trait is the per-namespace view of a storage backend. Every
//! backend kind in [`crate::BackendKind`] provides one implementation; the
//! set is closed, so the trait is sealed.

use async_trait::async_trait;
use serde_json::{Number, Value};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::error::{Result, StoreError};
use crate::path::{Category, PathKey};
use crate::tree;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Storage operations for one `(namespace, instance_id)` owner.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` and shared behind `Arc<dyn Driver>`.
/// Writes within one namespace are serialized by the driver; writes to
/// different namespaces proceed concurrently.
///
/// # Error Handling
///
/// Missing data is reported as `StoreError::NotFound`. Callers that want
/// defaults translate it; drivers never do.
#[async_trait]
pub trait Driver: sealed::Sealed + Send + Sync {
    fn namespace(&self) -> &str;

    fn instance_id(&self) -> &str;

    /// Backend kind serving this driver.
    fn backend(&self) -> BackendKind;

    /// Read the value at `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if nothing is stored at or under `key`.
    async fn get(&self, key: &PathKey) -> Result<Value>;

    /// Store `value` at `key`, creating intermediate containers.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::CannotSetSubfield` if an ancestor of `key` is
    /// stored as a scalar.
    async fn set(&self, key: &PathKey, value: Value) -> Result<()>;

    /// Remove the value at `key` and everything below it.
    ///
    /// No-op if nothing is stored there.
    async fn clear(&self, key: &PathKey) -> Result<()>;

    /// Atomically add `delta` to the number at `key`, starting from `default`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StoredTypeError` if the stored value is not a number.
    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number>;

    /// Atomically flip the boolean at `key`, starting from `default`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StoredTypeError` if the stored value is not a boolean.
    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool>;

    /// Read every category of this owner as `(category, tree)` pairs.
    ///
    /// Categories with no data are skipped.
    async fn export_data(
        &self,
        custom_groups: &HashMap<String, usize>,
    ) -> Result<Vec<(Category, Value)>> {
        let mut out = Vec::new();
        for category in categories(custom_groups) {
            let (pk_len, is_custom) = category.pkey_info(custom_groups)?;
            let key = PathKey::for_category(
                self.namespace(),
                self.instance_id(),
                category.clone(),
                pk_len,
                is_custom,
            );
            match self.get(&key).await {
                Ok(data) => out.push((category, data)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(
            namespace = self.namespace(),
            instance_id = self.instance_id(),
            categories = out.len(),
            "Exported namespace"
        );
        Ok(out)
    }

    /// Write exported category trees, one `set` per document.
    ///
    /// # Errors
    ///
    /// Wraps any write failure in `StoreError::MigrationFailure`.
    async fn import_data(
        &self,
        data: Vec<(Category, Value)>,
        custom_groups: &HashMap<String, usize>,
    ) -> Result<()> {
        for (category, tree_data) in data {
            let (pk_len, is_custom) = category.pkey_info(custom_groups)?;
            let base = PathKey::for_category(
                self.namespace(),
                self.instance_id(),
                category.clone(),
                pk_len,
                is_custom,
            );
            let documents = tree::split_primary_key(pk_len, tree_data)?;
            info!(
                namespace = self.namespace(),
                category = %category,
                documents = documents.len(),
                "Importing category"
            );
            for (primary_key, document) in documents {
                let key = base.with_primary_key(primary_key.iter().cloned())?;
                if let Err(e) = self.set(&key, document).await {
                    return Err(StoreError::MigrationFailure {
                        namespace: self.namespace().to_string(),
                        instance_id: self.instance_id().to_string(),
                        category: category.to_string(),
                        primary_key,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Built-in categories followed by the custom ones, sorted by name.
pub(crate) fn categories(custom_groups: &HashMap<String, usize>) -> Vec<Category> {
    let mut custom: Vec<&String> = custom_groups.keys().collect();
    custom.sort();
    Category::BUILTIN
        .into_iter()
        .chain(custom.into_iter().map(|name| Category::Custom(name.clone())))
        .collect()
}

/// Reject keys that belong to another owner, or that carry identifiers
/// without addressing a single document.
pub(crate) fn ensure_owner(driver: &dyn Driver, key: &PathKey) -> Result<()> {
    if key.namespace() != driver.namespace() || key.instance_id() != driver.instance_id() {
        return Err(StoreError::InvalidKey(format!(
            "{key} is outside {}/{}",
            driver.namespace(),
            driver.instance_id()
        )));
    }
    if !key.identifiers().is_empty() && !key.is_document_level() {
        return Err(StoreError::InvalidKey(format!(
            "{key}: identifiers need a complete primary key"
        )));
    }
    Ok(())
}

/// Reject names that cannot be used as a directory or collection name.
pub(crate) fn validate_owner_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(format!(
            "`{name}` cannot be used as a namespace or instance id"
        )));
    }
    Ok(())
}

/// Reject numeric/boolean operations above document level.
pub(crate) fn require_document_level(key: &PathKey) -> Result<()> {
    if key.is_document_level() {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(format!(
            "{key} does not address a single document"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_order() {
        let mut custom = HashMap::new();
        custom.insert("zeta".to_string(), 1);
        custom.insert("alpha".to_string(), 3);
        let names: Vec<String> = categories(&custom)
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["GLOBAL", "GUILD", "TEXTCHANNEL", "ROLE", "USER", "MEMBER", "alpha", "zeta"]
        );
    }

    #[tokio::test]
    async fn test_ensure_owner_rejects_loose_identifiers() {
        let dir = tempfile::TempDir::new().unwrap();
        let details = crate::config::ConnectionDetails {
            data_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let backend = crate::drivers::json::JsonBackend::initialize(&details).await.unwrap();
        let driver = backend.driver("core", "0").await.unwrap();

        let members = PathKey::for_category("core", "0", Category::Member, 2, false);
        assert!(ensure_owner(&driver, &members.with_identifier("x")).is_err());
        let full = members.with_primary_key(["1", "2"]).unwrap();
        assert!(ensure_owner(&driver, &full.with_identifier("x")).is_ok());
        let foreign = PathKey::for_category("other", "0", Category::Global, 0, false);
        assert!(ensure_owner(&driver, &foreign).is_err());
    }

    #[test]
    fn test_require_document_level() {
        let category = PathKey::for_category("core", "0", Category::Member, 2, false);
        assert!(require_document_level(&category).is_err());
        let partial = category.with_primary_key(["1"]).unwrap();
        assert!(require_document_level(&partial).is_err());
        let full = partial.with_primary_key(["2"]).unwrap();
        assert!(require_document_level(&full).is_ok());
        assert!(require_document_level(&full.with_identifier("x")).is_ok());
    }
}
