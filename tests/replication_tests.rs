mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    create_test_app, create_test_context, entity, spawn_server, wait_for, IsolatedServer,
};
use contentsync::replication::{
    apply_message, MessageKind, ReplicationClient, ReplicationClientConfig, ReplicationMessage,
    WebhookCallback, WebhookNotice,
};
use contentsync::storage::ChangeEvent;
use contentsync::sync::{init_remote_sync, LocalAddress, RemoteSyncOutcome};
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

async fn next_frame<S>(stream: &mut S) -> ReplicationMessage
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_socket_only_forwards_subscribed_types() {
    let (origin, _origin_dir) = create_test_context();
    origin.hub.forward_changes(&origin.store);
    let (app, _queue, _batches) = create_test_app(&origin, Duration::from_secs(1));
    let addr = spawn_server(app).await;

    let (ws, _) = connect_async(format!("ws://{}/_ws", addr)).await.unwrap();
    let (mut write, mut read) = ws.split();

    assert_eq!(next_frame(&mut read).await.kind, MessageKind::Connected);

    write
        .send(Message::Text(ReplicationMessage::subscribe("Post").to_json().into()))
        .await
        .unwrap();
    let subscribed = next_frame(&mut read).await;
    assert_eq!(subscribed.kind, MessageKind::Subscribed);
    assert_eq!(subscribed.data, json!(["Post"]));

    origin.store.write().set(entity("pg1", "Page", "cms", json!({})));
    origin.store.write().set(entity("p1", "Post", "cms", json!({"title": "Live"})));

    let frame = next_frame(&mut read).await;
    assert_eq!(frame.kind, MessageKind::NodeCreated);
    assert_eq!(frame.node_id.as_deref(), Some("p1"));
    assert_eq!(frame.node_type.as_deref(), Some("Post"));
    assert_eq!(frame.data["title"], "Live");

    write
        .send(Message::Text(ReplicationMessage::ping().to_json().into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut read).await.kind, MessageKind::Pong);

    write
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut read).await.kind, MessageKind::Error);
}

#[tokio::test]
async fn test_follower_seeds_then_replicates_live() {
    let (origin, _origin_dir) = create_test_context();
    origin.hub.forward_changes(&origin.store);
    {
        let mut store = origin.store.write();
        store.set(entity("p1", "Post", "cms", json!({"title": "Seeded"})));
        store.set(entity("p2", "Post", "cms", json!({})));
    }
    let (app, _queue, _batches) = create_test_app(&origin, Duration::from_secs(1));
    let addr = spawn_server(app).await;

    let (follower, follower_dir) = create_test_context();
    let mut config =
        ReplicationClientConfig::new(Url::parse(&format!("http://{}", addr)).unwrap());
    config.reconnect_delay = Duration::from_millis(100);
    let local = LocalAddress {
        host: "127.0.0.1".to_string(),
        port: 1,
    };

    let outcome = init_remote_sync(&follower, config, &local, None).await.unwrap();
    let replication = match outcome {
        RemoteSyncOutcome::Seeded { nodes, replication } => {
            assert_eq!(nodes, 2);
            replication
        }
        RemoteSyncOutcome::SelfReference => panic!("origin is not this instance"),
    };
    assert_eq!(
        follower.store.read().get("p1").unwrap().fields["title"],
        "Seeded"
    );
    assert!(follower_dir.path().join("cms.json").exists());

    // The client subscribes right after connecting; keep writing until a
    // frame makes it through
    let mut arrived = false;
    for i in 0..50 {
        origin
            .store
            .write()
            .set(entity("p3", "Post", "cms", json!({ "rev": i })));
        if wait_for(Duration::from_millis(100), || follower.store.read().contains("p3")).await {
            arrived = true;
            break;
        }
    }
    assert!(arrived, "live update never reached the follower");

    origin.remove_node("p1");
    assert!(
        wait_for(Duration::from_secs(5), || !follower.store.read().contains("p1")).await,
        "delete never reached the follower"
    );
    assert!(follower
        .deletions
        .read()
        .entries()
        .iter()
        .any(|e| e.node_id == "p1"));

    replication.abort();
}

#[tokio::test]
async fn test_client_gives_up_after_max_attempts() {
    let (ctx, _tmp_dir) = create_test_context();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config =
        ReplicationClientConfig::new(Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap());
    config.reconnect_delay = Duration::from_millis(50);
    config.max_reconnect_attempts = Some(2);

    // Three failed connects with a fixed delay between each
    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), ReplicationClient::new(ctx, config).run())
        .await
        .expect("client kept retrying past its ceiling");
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_follower_reconciles_after_origin_restarts() {
    let (origin, _origin_dir) = create_test_context();
    origin.hub.forward_changes(&origin.store);
    {
        let mut store = origin.store.write();
        store.set(entity("p1", "Post", "cms", json!({})));
        store.set(entity("p2", "Post", "cms", json!({})));
    }
    let (app, _queue, _batches) = create_test_app(&origin, Duration::from_secs(1));
    let mut server = IsolatedServer::start(app.clone(), "127.0.0.1:0".parse().unwrap());
    let addr = server.addr;

    let (follower, _follower_dir) = create_test_context();
    let mut config =
        ReplicationClientConfig::new(Url::parse(&format!("http://{}", addr)).unwrap());
    config.reconnect_delay = Duration::from_millis(200);
    // One failed attempt per outage is tolerated only if the count resets
    // after each reconnect
    config.max_reconnect_attempts = Some(1);
    let local = LocalAddress {
        host: "127.0.0.1".to_string(),
        port: 1,
    };
    let replication = match init_remote_sync(&follower, config, &local, None).await.unwrap() {
        RemoteSyncOutcome::Seeded { replication, .. } => replication,
        RemoteSyncOutcome::SelfReference => panic!("origin is not this instance"),
    };

    // Live connection is up once a write makes it through
    let mut live = false;
    for i in 0..50 {
        origin
            .store
            .write()
            .set(entity("warmup", "Post", "cms", json!({ "rev": i })));
        if wait_for(Duration::from_millis(100), || follower.store.read().contains("warmup")).await {
            live = true;
            break;
        }
    }
    assert!(live, "follower never went live");

    for (round, removed) in ["p1", "p2"].into_iter().enumerate() {
        server.stop();

        // Changes made while the follower is disconnected
        let offline = format!("offline-{}", round);
        origin.remove_node(removed);
        origin
            .store
            .write()
            .set(entity(&offline, "Post", "cms", json!({})));

        server = IsolatedServer::start(app.clone(), addr);

        assert!(
            wait_for(Duration::from_secs(5), || {
                let store = follower.store.read();
                store.contains(&offline) && !store.contains(removed)
            })
            .await,
            "follower not reconciled after restart {}",
            round
        );

        // Subscribed again, so new writes stream in
        let after = format!("after-{}", round);
        origin
            .store
            .write()
            .set(entity(&after, "Post", "cms", json!({})));
        assert!(
            wait_for(Duration::from_secs(5), || follower.store.read().contains(&after)).await,
            "live update after restart {} never arrived",
            round
        );
    }

    assert!(!replication.is_finished());
    assert!(follower.deletions.read().entries().iter().any(|e| e.node_id == "p2"));

    replication.abort();
    server.stop();
}

#[tokio::test]
async fn test_remote_pointing_at_self_is_refused() {
    let (ctx, _tmp_dir) = create_test_context();
    let config = ReplicationClientConfig::new(Url::parse("http://localhost:4000").unwrap());
    let local = LocalAddress {
        host: "0.0.0.0".to_string(),
        port: 4000,
    };

    let outcome = init_remote_sync(&ctx, config, &local, None).await.unwrap();
    assert!(matches!(outcome, RemoteSyncOutcome::SelfReference));
}

#[tokio::test]
async fn test_locally_handled_plugins_are_skipped() {
    let (ctx, tmp_dir) = create_test_context();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_callback = seen.clone();
    let callback: WebhookCallback = Arc::new(move |notice: WebhookNotice| {
        seen_by_callback.lock().push(notice.path.clone());
        notice.plugin_name == "shop"
    });
    let mut handled = HashSet::new();

    let notice = |plugin: &str| {
        ReplicationMessage::webhook_received(&WebhookNotice {
            plugin_name: plugin.to_string(),
            path: "orders".to_string(),
            body: json!({"id": 1}),
        })
    };
    assert!(apply_message(&ctx, notice("shop"), &mut handled, Some(&callback))
        .await
        .is_none());
    apply_message(&ctx, notice("cms"), &mut handled, Some(&callback)).await;
    assert_eq!(handled, HashSet::from(["shop".to_string()]));
    assert_eq!(seen.lock().len(), 2);

    let product = ReplicationMessage::from_change(&ChangeEvent::Created(entity(
        "x1",
        "Product",
        "shop",
        json!({}),
    )));
    assert!(apply_message(&ctx, product, &mut handled, Some(&callback))
        .await
        .is_none());
    assert!(!ctx.store.read().contains("x1"));

    let post = entity("p1", "Post", "cms", json!({"title": "Hi"}));
    let created = ReplicationMessage::from_change(&ChangeEvent::Created(post.clone()));
    assert_eq!(
        apply_message(&ctx, created, &mut handled, Some(&callback)).await,
        Some("cms".to_string())
    );
    assert_eq!(ctx.store.read().get("p1").unwrap().fields["title"], "Hi");
    assert!(tmp_dir.path().join("cms.json").exists());

    let deleted = ReplicationMessage::from_change(&ChangeEvent::Deleted(post));
    assert_eq!(
        apply_message(&ctx, deleted, &mut handled, None).await,
        Some("cms".to_string())
    );
    assert!(!ctx.store.read().contains("p1"));
    assert_eq!(ctx.deletions.read().len(), 1);
    assert!(tmp_dir.path().join("_deletions.json").exists());

    // Unknown deletes are ignored
    let ghost = ReplicationMessage::from_change(&ChangeEvent::Deleted(entity(
        "ghost",
        "Post",
        "cms",
        json!({}),
    )));
    assert!(apply_message(&ctx, ghost, &mut handled, None).await.is_none());
}
