use nestconf::{Backend, Category, Config, Driver, Migrator, StorageConfig, StoreError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn custom_groups() -> HashMap<String, usize> {
    HashMap::from([("tags".to_string(), 3)])
}

async fn seed(backend: &Backend) {
    let config = Config::open(backend, "core", "0").await.unwrap();
    config.init_custom("tags", 3).unwrap();

    config.value("prefix").set(json!(["!"])).await.unwrap();
    config.global().group("limits").value("daily").set(json!(5)).await.unwrap();
    config.guild(1).value("name").set(json!("one")).await.unwrap();
    config.guild(2).value("name").set(json!("two")).await.unwrap();
    config.member(1, 10).value("xp").set(json!(100)).await.unwrap();
    config.member(1, 11).value("xp").set(json!(7)).await.unwrap();
    config
        .custom("tags", ["a", "b", "c"])
        .unwrap()
        .value("weight")
        .set(json!(1.5))
        .await
        .unwrap();
    config
        .custom("tags", ["a", "x", "y"])
        .unwrap()
        .set(json!({"nested": {"deep": true}}).as_object().cloned().unwrap())
        .await
        .unwrap();

    let other = Config::open(backend, "audio", "0").await.unwrap();
    other.user(99).value("volume").set(json!(80)).await.unwrap();
}

async fn export(backend: &Backend, namespace: &str) -> Vec<(Category, Value)> {
    let driver: Arc<dyn Driver> = backend.raw_driver(namespace, "0").await.unwrap();
    let custom = if namespace == "core" { custom_groups() } else { HashMap::new() };
    driver.export_data(&custom).await.unwrap()
}

async fn migrate(source: &Backend, destination: &Backend) {
    let report = Migrator::new(source, destination)
        .with_custom_groups("core", custom_groups())
        .run()
        .await
        .unwrap();
    assert_eq!(report.owners.len(), 2);
}

#[tokio::test]
async fn test_round_trip_through_every_file_backend() {
    let dir = TempDir::new().unwrap();
    let json_backend = Backend::initialize(&StorageConfig::flat_file(dir.path().join("json")))
        .await
        .unwrap();
    let bucket_backend = Backend::initialize(&StorageConfig::hash_bucket(dir.path().join("buckets"), 4))
        .await
        .unwrap();
    seed(&json_backend).await;

    let original_core = export(&json_backend, "core").await;
    let original_audio = export(&json_backend, "audio").await;
    let categories: Vec<&Category> = original_core.iter().map(|(c, _)| c).collect();
    assert_eq!(
        categories,
        vec![
            &Category::Global,
            &Category::Guild,
            &Category::Member,
            &Category::Custom("tags".to_string())
        ]
    );

    migrate(&json_backend, &bucket_backend).await;
    assert_eq!(export(&bucket_backend, "core").await, original_core);
    assert_eq!(export(&bucket_backend, "audio").await, original_audio);

    #[cfg(feature = "sql")]
    {
        let sql_backend = Backend::initialize(&StorageConfig::sql(":memory:")).await.unwrap();
        migrate(&bucket_backend, &sql_backend).await;
        assert_eq!(export(&sql_backend, "core").await, original_core);

        let back = Backend::initialize(&StorageConfig::flat_file(dir.path().join("back")))
            .await
            .unwrap();
        migrate(&sql_backend, &back).await;
        assert_eq!(export(&back, "core").await, original_core);
        assert_eq!(export(&back, "audio").await, original_audio);
    }
}

#[tokio::test]
async fn test_destination_failure_aborts() {
    let dir = TempDir::new().unwrap();
    let source = Backend::initialize(&StorageConfig::flat_file(dir.path().join("src")))
        .await
        .unwrap();
    let destination = Backend::initialize(&StorageConfig::flat_file(dir.path().join("dst")))
        .await
        .unwrap();
    let config = Config::open(&source, "core", "0").await.unwrap();
    config.guild(1).value("name").set(json!("one")).await.unwrap();

    destination.teardown().await.unwrap();
    let err = Migrator::new(&source, &destination).run().await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)), "{err}");
}

#[tokio::test]
async fn test_unregistered_custom_group_is_not_copied() {
    let dir = TempDir::new().unwrap();
    let source = Backend::initialize(&StorageConfig::flat_file(dir.path().join("src")))
        .await
        .unwrap();
    let destination = Backend::initialize(&StorageConfig::flat_file(dir.path().join("dst")))
        .await
        .unwrap();
    seed(&source).await;

    Migrator::new(&source, &destination).run().await.unwrap();
    let copied = export(&destination, "core").await;
    assert!(copied
        .iter()
        .all(|(category, _)| !category.is_custom()));
}
