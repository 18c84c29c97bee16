use nestconf::{Backend, Config, StorageConfig};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

async fn reopen(dir: &TempDir) -> (Backend, Config) {
    let backend = Backend::initialize(&StorageConfig::flat_file(dir.path())).await.unwrap();
    let config = Config::open(&backend, "core", "0").await.unwrap();
    (backend, config)
}

#[tokio::test]
async fn test_interrupted_write_keeps_previous_document() {
    let dir = TempDir::new().unwrap();
    {
        let (backend, config) = reopen(&dir).await;
        config.value("prefix").set(json!(["!"])).await.unwrap();
        backend.teardown().await.unwrap();
    }

    // A writer died after creating its temp file but before the rename.
    let ns_dir = dir.path().join("core");
    let stale = ns_dir.join(".settings.json.0123abcd.tmp");
    fs::write(&stale, br#"{"0": {"GLOBAL": {"prefix": ["half"#).unwrap();

    let (backend, config) = reopen(&dir).await;
    assert_eq!(config.value("prefix").get().await.unwrap(), json!(["!"]));
    assert!(!stale.exists());

    let leftovers: Vec<_> = fs::read_dir(&ns_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["settings.json".to_string()]);
    backend.teardown().await.unwrap();
}

#[tokio::test]
async fn test_completed_write_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (backend, config) = reopen(&dir).await;
        config.value("prefix").set(json!(["!"])).await.unwrap();
        config.value("prefix").set(json!(["?"])).await.unwrap();
        backend.teardown().await.unwrap();
    }

    let on_disk: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("core").join("settings.json")).unwrap())
            .unwrap();
    assert_eq!(on_disk, json!({"0": {"GLOBAL": {"prefix": ["?"]}}}));

    let (_backend, config) = reopen(&dir).await;
    assert_eq!(config.value("prefix").get().await.unwrap(), json!(["?"]));
}

#[tokio::test]
async fn test_concurrent_writers_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let (backend, config) = reopen(&dir).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            config.guild(i).value("n").set(json!(i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let guilds = config.all_guilds().await.unwrap();
    assert_eq!(guilds.len(), 16);
    backend.teardown().await.unwrap();

    let (_backend, reopened) = reopen(&dir).await;
    assert_eq!(reopened.all_guilds().await.unwrap().len(), 16);
}
