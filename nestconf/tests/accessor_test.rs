use nestconf::{Backend, Config, PathKey, StorageConfig};
use serde_json::json;
use tempfile::TempDir;

async fn backends(dir: &TempDir) -> Vec<Backend> {
    let mut configs = vec![
        StorageConfig::flat_file(dir.path().join("json")),
        StorageConfig::hash_bucket(dir.path().join("buckets"), 16),
    ];
    if cfg!(feature = "sql") {
        configs.push(StorageConfig::sql(":memory:"));
    }
    let mut out = Vec::new();
    for config in configs {
        out.push(Backend::initialize(&config).await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_prefix_defaults_scenario() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir).await {
        let config = Config::open(&backend, "core", "0").await.unwrap();
        config
            .register_global(json!({"prefix": ["!"], "owner": null}))
            .unwrap();

        let prefix = config.global().value("prefix");
        assert_eq!(prefix.get().await.unwrap(), json!(["!"]), "{:?}", backend.kind());

        prefix.set(json!(["?", "!!"])).await.unwrap();
        assert_eq!(prefix.get().await.unwrap(), json!(["?", "!!"]));

        prefix.clear().await.unwrap();
        assert_eq!(prefix.get().await.unwrap(), json!(["!"]));
        assert_eq!(config.value("owner").get().await.unwrap(), json!(null));

        backend.teardown().await.unwrap();
    }
}

#[tokio::test]
async fn test_increment_scenario() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir).await {
        let config = Config::open(&backend, "core", "0").await.unwrap();
        let counter = config.guild(1).value("counter");

        assert_eq!(counter.increment(5).await.unwrap().as_i64(), Some(5));
        assert_eq!(counter.get().await.unwrap(), json!(5));
        assert_eq!(counter.increment(-2).await.unwrap().as_i64(), Some(3));

        let label = config.guild(1).value("label");
        label.set(json!("text")).await.unwrap();
        let err = label.increment(1).await.unwrap_err();
        assert!(err.is_stored_type_error(), "{:?}: {err}", backend.kind());
        assert_eq!(label.get().await.unwrap(), json!("text"));

        let flag = config.guild(1).value("flag");
        assert!(flag.toggle().await.unwrap());
        assert!(!flag.toggle().await.unwrap());

        backend.teardown().await.unwrap();
    }
}

#[tokio::test]
async fn test_round_trip_values() {
    let dir = TempDir::new().unwrap();
    let values = [
        json!({"a": {"b": [1, 2, {"c": null}]}}),
        json!([1, "two", 3.5, false]),
        json!("scalar"),
        json!(42),
        json!(null),
    ];
    for backend in backends(&dir).await {
        let config = Config::open(&backend, "roundtrip", "0").await.unwrap();
        for (i, value) in values.iter().enumerate() {
            let slot = config.global().value(&format!("v{i}"));
            slot.set(value.clone()).await.unwrap();
            assert_eq!(&slot.get_or(json!("missing")).await.unwrap(), value);
        }

        let slot = config.global().value("v0");
        slot.clear().await.unwrap();
        slot.clear().await.unwrap();
        assert_eq!(slot.get().await.unwrap(), json!(null));

        backend.teardown().await.unwrap();
    }
}

#[tokio::test]
async fn test_subfield_of_scalar_is_rejected() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir).await {
        let config = Config::open(&backend, "core", "0").await.unwrap();
        let global = config.global();
        global.value("name").set(json!("plain")).await.unwrap();

        let err = global.set_raw(&["name", "inner"], json!(1)).await.unwrap_err();
        assert!(err.is_cannot_set_subfield(), "{:?}: {err}", backend.kind());
        assert_eq!(global.value("name").get().await.unwrap(), json!("plain"));

        backend.teardown().await.unwrap();
    }
}

#[tokio::test]
async fn test_group_edit_and_scope_listing() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir).await {
        let config = Config::open(&backend, "core", "0").await.unwrap();
        config.register_guild(json!({"mods": [], "strict": false})).unwrap();

        config
            .guild(10)
            .edit(|guild| {
                guild.insert("strict".to_string(), json!(true));
            })
            .await
            .unwrap();
        config.guild(20).value("mods").set(json!([7])).await.unwrap();

        let guilds = config.all_guilds().await.unwrap();
        assert_eq!(guilds.len(), 2);
        assert_eq!(guilds["10"], json!({"mods": [], "strict": true}));
        assert_eq!(guilds["20"], json!({"mods": [7], "strict": false}));

        config.clear_all_guilds().await.unwrap();
        assert!(config.all_guilds().await.unwrap().is_empty());

        backend.teardown().await.unwrap();
    }
}

#[tokio::test]
async fn test_namespace_root_round_trip() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir).await {
        let kind = backend.kind();
        let config = Config::open(&backend, "core", "0").await.unwrap();
        config.init_custom("tags", 1).unwrap();
        config
            .global()
            .set(json!({"prefix": ["!"], "owner": "me"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        config.guild(5).value("label").set(json!("text")).await.unwrap();
        config
            .custom("tags", ["a"])
            .unwrap()
            .value("w")
            .set(json!(1))
            .await
            .unwrap();

        let root = PathKey::for_namespace("core", "0");
        let driver = config.driver();
        let snapshot = driver.get(&root).await.unwrap();
        assert_eq!(
            snapshot,
            json!({
                "GLOBAL": {"prefix": ["!"], "owner": "me"},
                "GUILD": {"5": {"label": "text"}},
                "tags": {"a": {"w": 1}}
            }),
            "{kind:?}"
        );

        driver.set(&root, snapshot.clone()).await.unwrap();
        assert_eq!(driver.get(&root).await.unwrap(), snapshot, "{kind:?}");

        let mut edited = snapshot.clone();
        edited["GUILD"] = json!({"6": {"label": "moved"}});
        edited["tags"]["b"] = json!({"w": 2});
        driver.set(&root, edited.clone()).await.unwrap();
        assert_eq!(driver.get(&root).await.unwrap(), edited, "{kind:?}");
        assert_eq!(config.guild(5).all().await.unwrap(), serde_json::Map::new());
        assert_eq!(
            config.custom("tags", ["b"]).unwrap().value("w").get().await.unwrap(),
            json!(2)
        );
        assert_eq!(config.global().value("owner").get().await.unwrap(), json!("me"));

        backend.teardown().await.unwrap();
    }
}
