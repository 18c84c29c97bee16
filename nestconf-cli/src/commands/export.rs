//! Export command implementation.

use anyhow::{Context, Result};
use nestconf::Backend;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::{load_custom_groups, open_backend};

/// Write `{category: tree}` for one namespace instance as pretty JSON.
pub async fn run_export(
    config: &Path,
    namespace: &str,
    instance_id: &str,
    custom_groups: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let groups = load_custom_groups(custom_groups)?;
    let custom = groups.get(namespace).cloned().unwrap_or_default();

    let backend = open_backend(config).await?;
    let exported = export_namespace(&backend, namespace, instance_id, &custom).await;
    backend.teardown().await?;
    let exported = exported?;

    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &exported)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            eprintln!("Export complete: {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer_pretty(&mut lock, &exported)?;
            writeln!(lock)?;
        }
    }
    Ok(())
}

async fn export_namespace(
    backend: &Backend,
    namespace: &str,
    instance_id: &str,
    custom: &HashMap<String, usize>,
) -> Result<Value> {
    let driver = backend
        .raw_driver(namespace, instance_id)
        .await
        .with_context(|| format!("Failed to open {namespace}/{instance_id}"))?;
    let data = driver
        .export_data(custom)
        .await
        .with_context(|| format!("Failed to export {namespace}/{instance_id}"))?;
    let categories: Map<String, Value> = data
        .into_iter()
        .map(|(category, tree)| (category.to_string(), tree))
        .collect();
    Ok(Value::Object(categories))
}
