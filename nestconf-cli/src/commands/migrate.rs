//! Migrate command implementation.

use anyhow::{Context, Result};
use nestconf::Migrator;
use std::path::Path;

use super::{load_custom_groups, open_backend};

/// Copy everything from the `from` backend to the `to` backend.
pub async fn run_migrate(from: &Path, to: &Path, custom_groups: Option<&Path>) -> Result<()> {
    let groups = load_custom_groups(custom_groups)?;
    let source = open_backend(from).await?;
    let destination = open_backend(to).await?;

    println!("Migrating {} -> {}", source.kind(), destination.kind());
    let outcome = Migrator::new(&source, &destination)
        .with_all_custom_groups(groups)
        .run()
        .await;

    // Tear both down whether or not the copy succeeded.
    let teardown = source.teardown().await.and(destination.teardown().await);
    let report = outcome.context("Migration failed")?;
    teardown.context("Failed to tear down backends")?;

    for (namespace, instance_id) in &report.owners {
        println!("  {namespace}/{instance_id}");
    }
    println!(
        "Migrated {} namespace instance(s), {} categories in {} ms",
        report.owners.len(),
        report.categories,
        report.elapsed().num_milliseconds()
    );
    Ok(())
}
