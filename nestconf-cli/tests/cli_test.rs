//! End-to-end tests for the `nestconf` binary.

use nestconf::{Backend, Config, StorageConfig};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn run_nestconf(args: &[&str]) -> (bool, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_nestconf"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute nestconf");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn write_config(dir: &Path, name: &str, config: &StorageConfig) -> PathBuf {
    let path = dir.join(format!("{name}.toml"));
    config.save(&path).unwrap();
    path
}

#[tokio::test]
async fn test_migrate_then_export() {
    let dir = TempDir::new().unwrap();
    let from_cfg = StorageConfig::flat_file(dir.path().join("json"));
    let to_cfg = StorageConfig::hash_bucket(dir.path().join("buckets"), 8);
    let from = write_config(dir.path(), "from", &from_cfg);
    let to = write_config(dir.path(), "to", &to_cfg);

    {
        let backend = Backend::initialize(&from_cfg).await.unwrap();
        let config = Config::open(&backend, "core", "0").await.unwrap();
        config.value("prefix").set(json!(["!"])).await.unwrap();
        config.member(1, 2).value("xp").set(json!(3)).await.unwrap();
        backend.teardown().await.unwrap();
    }

    let (ok, stdout, stderr) = run_nestconf(&[
        "migrate",
        "--from",
        from.to_str().unwrap(),
        "--to",
        to.to_str().unwrap(),
    ]);
    assert!(ok, "migrate failed: {stderr}");
    assert!(stdout.contains("core/0"));

    let (ok, stdout, _) = run_nestconf(&["list", "--config", to.to_str().unwrap()]);
    assert!(ok);
    assert_eq!(stdout.trim(), "core/0");

    let (ok, stdout, stderr) = run_nestconf(&[
        "export",
        "--config",
        to.to_str().unwrap(),
        "--namespace",
        "core",
    ]);
    assert!(ok, "export failed: {stderr}");
    let exported: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(
        exported,
        json!({"GLOBAL": {"prefix": ["!"]}, "MEMBER": {"1": {"2": {"xp": 3}}}})
    );
}

#[test]
fn test_delete_all_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "store", &StorageConfig::flat_file(dir.path().join("data")));

    let (ok, _, stderr) = run_nestconf(&["delete-all", "--config", config.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("--yes"));

    let (ok, stdout, _) = run_nestconf(&["delete-all", "--config", config.to_str().unwrap(), "--yes"]);
    assert!(ok);
    assert!(stdout.contains("json"));
}

#[test]
fn test_bad_backend_fails_before_data_access() {
    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "backend = \"cassandra\"\n").unwrap();
    let good = write_config(dir.path(), "good", &StorageConfig::flat_file(dir.path().join("data")));

    let (ok, _, stderr) = run_nestconf(&[
        "migrate",
        "--from",
        bad.to_str().unwrap(),
        "--to",
        good.to_str().unwrap(),
    ]);
    assert!(!ok);
    assert!(stderr.contains("cassandra"), "{stderr}");
}
