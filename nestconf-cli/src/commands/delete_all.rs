use anyhow::{Context, Result};
use nestconf::DeleteOptions;
use std::path::Path;

use super::open_backend;

/// Delete every namespace the configured backend stores.
pub async fn run_delete_all(config: &Path, drop_target: bool, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete all data without --yes");
    }
    let backend = open_backend(config).await?;
    let result = backend
        .delete_all(DeleteOptions { drop_target })
        .await
        .context("Failed to delete data");
    backend.teardown().await?;
    result?;
    println!("Deleted all data from the {} backend", backend.kind());
    Ok(())
}
