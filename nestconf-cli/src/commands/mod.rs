pub mod delete_all;
pub mod export;
pub mod list;
pub mod migrate;

pub use delete_all::run_delete_all;
pub use export::run_export;
pub use list::run_list;
pub use migrate::run_migrate;

use anyhow::{Context, Result};
use nestconf::{Backend, CustomGroups, StorageConfig};
use std::path::Path;

/// Load a storage config and initialize its backend.
pub(crate) async fn open_backend(path: &Path) -> Result<Backend> {
    let config = StorageConfig::load(path)
        .with_context(|| format!("Failed to load storage config {:?}", path))?;
    if !config.backend.is_available() {
        anyhow::bail!(
            "Backend '{}' in {:?} is not compiled into this binary; rebuild with --features {}",
            config.backend,
            path,
            config.backend.feature().unwrap_or_default()
        );
    }
    Backend::initialize(&config)
        .await
        .with_context(|| format!("Failed to initialize '{}' backend from {:?}", config.backend, path))
}

/// Read a `{namespace: {group: arity}}` JSON file.
pub(crate) fn load_custom_groups(path: Option<&Path>) -> Result<CustomGroups> {
    let Some(path) = path else {
        return Ok(CustomGroups::new());
    };
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("{:?} must map namespace -> {{group: arity}}", path))
}
