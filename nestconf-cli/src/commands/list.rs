use anyhow::{Context, Result};
use futures::TryStreamExt;
use nestconf::Backend;
use std::path::Path;

use super::open_backend;

/// Print every stored `namespace/instance` pair.
pub async fn run_list(config: &Path) -> Result<()> {
    let backend = open_backend(config).await?;
    let result = print_owners(&backend).await;
    backend.teardown().await?;
    result
}

async fn print_owners(backend: &Backend) -> Result<()> {
    let mut owners: Vec<(String, String)> = backend
        .iterate_namespaces()
        .try_collect()
        .await
        .context("Failed to list namespaces")?;
    owners.sort();
    for (namespace, instance_id) in &owners {
        println!("{namespace}/{instance_id}");
    }
    tracing::info!(count = owners.len(), backend = %backend.kind(), "Listed namespaces");
    Ok(())
}
