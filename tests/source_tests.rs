mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::create_test_context;
use contentsync::source::{run_source, source_all, SOURCE_ID_FIELD};
use contentsync::{JsonFileSource, SourceActions, SyncError, SyncNotice};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Feeds live outside the cache dir so snapshots never overwrite them
fn feed_path(tmp_dir: &TempDir, name: &str) -> PathBuf {
    let dir = tmp_dir.path().join("feeds");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

async fn write_feed(path: &Path, feed: Value) {
    tokio::fs::write(path, serde_json::to_vec(&feed).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_json_file_source_creates_nodes() {
    let (ctx, tmp_dir) = create_test_context();
    let feed = feed_path(&tmp_dir, "blog.json");
    write_feed(
        &feed,
        json!({"items": [
            {"id": 1, "type": "Post", "title": "Hello"},
            {"id": "a", "type": "Author", "name": "Ada"},
            {"id": 2, "title": "Untyped"},
            {"type": "Post", "title": "No id"},
            "not an object"
        ]}),
    )
    .await;
    ctx.plugins
        .register(Arc::new(JsonFileSource::new("blog", &feed)), Value::Null);

    let report = run_source(&ctx, "blog").await.unwrap();
    assert_eq!(report.nodes, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(report.touched_owners, vec!["blog".to_string()]);

    let actions = SourceActions::new(ctx.clone(), "blog", vec![]);
    let post = actions.get_node(&actions.create_node_id("Post:1")).unwrap();
    assert_eq!(post.owner, "blog");
    assert_eq!(post.fields["title"], "Hello");
    assert_eq!(post.fields[SOURCE_ID_FIELD], "1");
    assert_eq!(actions.get_nodes().len(), 2);
    assert_eq!(actions.get_nodes_by_type("Author").len(), 1);
}

#[tokio::test]
async fn test_default_type_applies_to_untyped_items() {
    let (ctx, tmp_dir) = create_test_context();
    let feed = feed_path(&tmp_dir, "pages.json");
    write_feed(&feed, json!([{"id": 1}, {"id": 2, "type": "Landing"}])).await;
    ctx.plugins.register(
        Arc::new(JsonFileSource::new("pages", &feed).with_default_type("Page")),
        Value::Null,
    );

    run_source(&ctx, "pages").await.unwrap();
    let store = ctx.store.read();
    assert_eq!(store.get_by_type("Page").len(), 1);
    assert_eq!(store.get_by_type("Landing").len(), 1);
}

#[tokio::test]
async fn test_resourcing_is_idempotent_and_removes_stale_nodes() {
    let (ctx, tmp_dir) = create_test_context();
    let feed = feed_path(&tmp_dir, "blog.json");
    write_feed(
        &feed,
        json!([
            {"id": 1, "type": "Post", "title": "One"},
            {"id": 2, "type": "Post", "title": "Two"}
        ]),
    )
    .await;
    ctx.plugins
        .register(Arc::new(JsonFileSource::new("blog", &feed)), Value::Null);
    run_source(&ctx, "blog").await.unwrap();

    let actions = SourceActions::new(ctx.clone(), "blog", vec![]);
    let one_id = actions.create_node_id("Post:1");
    let two_id = actions.create_node_id("Post:2");
    let before = actions.get_node(&one_id).unwrap();

    // Same content: nothing is rewritten
    let mut changes = ctx.store.read().subscribe();
    let report = run_source(&ctx, "blog").await.unwrap();
    assert_eq!(report.nodes, 2);
    assert!(report.touched_owners.is_empty());
    assert!(changes.try_recv().is_err());
    assert_eq!(actions.get_node(&one_id).unwrap().modified_at, before.modified_at);

    // Item 2 disappears from the feed, item 1 changes
    write_feed(&feed, json!([{"id": 1, "type": "Post", "title": "One, edited"}])).await;
    let report = run_source(&ctx, "blog").await.unwrap();
    assert_eq!(report.removed, 1);

    let after = actions.get_node(&one_id).unwrap();
    assert_eq!(after.fields["title"], "One, edited");
    assert_eq!(after.created_at, before.created_at);
    assert!(after.modified_at >= before.modified_at);
    assert!(actions.get_node(&two_id).is_none());

    let log = ctx.deletions.read();
    assert_eq!(log.len(), 1);
    assert_eq!(log.entries()[0].node_id, two_id);
}

#[tokio::test]
async fn test_failed_run_keeps_existing_nodes() {
    let (ctx, tmp_dir) = create_test_context();
    let feed = feed_path(&tmp_dir, "blog.json");
    write_feed(&feed, json!([{"id": 1, "type": "Post"}])).await;
    ctx.plugins
        .register(Arc::new(JsonFileSource::new("blog", &feed)), Value::Null);
    run_source(&ctx, "blog").await.unwrap();

    tokio::fs::write(&feed, b"[{broken").await.unwrap();
    let err = run_source(&ctx, "blog").await.unwrap_err();
    assert!(matches!(err, SyncError::Plugin { ref plugin, .. } if plugin == "blog"));
    assert_eq!(ctx.store.read().len(), 1);
    assert!(ctx.deletions.read().is_empty());
}

#[tokio::test]
async fn test_unknown_plugin_is_not_found() {
    let (ctx, _tmp_dir) = create_test_context();
    assert!(matches!(
        run_source(&ctx, "ghost").await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_source_all_saves_caches_and_notifies() {
    let (ctx, tmp_dir) = create_test_context();
    let good = feed_path(&tmp_dir, "good.json");
    write_feed(&good, json!([{"id": 1, "type": "Post"}])).await;
    ctx.plugins
        .register(Arc::new(JsonFileSource::new("good", &good)), Value::Null);
    ctx.plugins.register(
        Arc::new(JsonFileSource::new("missing", feed_path(&tmp_dir, "nope.json"))),
        Value::Null,
    );
    let mut notices = ctx.subscribe_notices();

    assert_eq!(source_all(&ctx).await, 1);
    assert!(tmp_dir.path().join("good.json").exists());
    assert_eq!(ctx.cache.cached_owners().await.unwrap(), vec!["good".to_string()]);

    assert_eq!(
        notices.recv().await.unwrap(),
        SyncNotice::SourceCompleted {
            plugin: "good".into(),
            nodes: 1,
            removed: 0
        }
    );
}

#[tokio::test]
async fn test_extend_and_delete_by_source_id() {
    let (ctx, _tmp_dir) = create_test_context();
    let actions = SourceActions::new(
        ctx.clone(),
        "shop",
        vec!["Product".to_string(), "Variant".to_string()],
    );

    let id = actions.create_node_id("Variant:99");
    let fields = json!({"sku": "V-99"}).as_object().unwrap().clone();
    actions
        .create_node(contentsync::Entity::new(id.clone(), "Variant", "someone-else", fields))
        .unwrap();
    assert_eq!(actions.get_node(&id).unwrap().owner, "shop");

    let extra = json!({"price": 12, "owner": "spoofed"}).as_object().unwrap().clone();
    let extended = actions.extend_node(&id, extra).unwrap();
    assert_eq!(extended.fields["price"], 12);
    assert_eq!(extended.owner, "shop");

    assert!(matches!(
        actions.extend_node("missing", Default::default()),
        Err(SyncError::NodeNotFound(_))
    ));

    assert_eq!(actions.delete_by_source_id("99"), Some(id.clone()));
    assert!(actions.get_node(&id).is_none());
    assert_eq!(actions.delete_by_source_id("99"), None);
    assert!(!actions.delete_node(&id));
}
