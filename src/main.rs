use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use clap::Parser;
use contentsync::{
    create_router,
    replication::WebhookCallback,
    source::source_all,
    storage::spawn_cleanup_task,
    sync::{init_remote_sync, LocalAddress, RemoteSyncOutcome},
    webhooks::{spawn_processor, DefaultWebhookHandler, QueuedWebhook, WebhookHandler, WebhookQueue, WebhookRelay},
    AppState, JsonFileSource, SyncConfig, SyncContext,
};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "contentsync")]
#[command(about = "contentsync - replicated content synchronization layer", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Directory for per-source cache snapshots
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Origin to follow (e.g., --remote http://origin:4000)
    #[arg(long)]
    remote: Option<String>,

    /// JSON feed source (e.g., --source blog=./feeds/blog.json)
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<(String, PathBuf)>,
}

fn parse_source(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=path, got {:?}", raw))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected name=path, got {:?}", raw));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

impl Args {
    fn into_config(self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::from_file(path)?,
            None => SyncConfig::default(),
        };
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(dir) = self.cache_dir {
            config.cache.dir = dir;
        }
        if let Some(remote) = self.remote {
            config.replication.remote_url = Some(remote);
        }
        config.sources.extend(self.sources);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contentsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    let ctx = SyncContext::new(&config.cache.dir, config.deletion_log());

    match ctx.restore().await {
        Ok(n) => tracing::info!("Cache restored ({} nodes)", n),
        Err(e) => tracing::warn!("Cache restore failed, starting empty: {}", e),
    }

    // Sources and their fallback webhook handlers
    for (name, path) in &config.sources {
        ctx.plugins
            .register(Arc::new(JsonFileSource::new(name, path)), Value::Null);
        let handler: Arc<dyn WebhookHandler> = match &config.webhooks.signing_secret {
            Some(secret) => Arc::new(DefaultWebhookHandler::signed(secret)),
            None => Arc::new(DefaultWebhookHandler::new()),
        };
        ctx.webhooks.ensure_default(name, handler);
        tracing::info!("Registered source {} ({})", name, path.display());
    }

    let (queue, batches) = WebhookQueue::new(config.debounce());
    spawn_processor(ctx.clone(), batches);
    ctx.hub.forward_changes(&ctx.store);

    let cleanup_ctx = ctx.clone();
    spawn_cleanup_task(ctx.deletions.clone(), move || {
        let ctx = cleanup_ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.persist_deletions().await {
                tracing::warn!("Failed to persist deletion log: {}", e);
            }
        });
    });

    // Follow a remote origin, or source locally
    let mut seeded = false;
    if let Some(client_config) = config.replication_client()? {
        let local = LocalAddress {
            host: config.server.host.clone(),
            port: config.server.port,
        };
        match init_remote_sync(&ctx, client_config, &local, Some(local_webhook_callback(&ctx, &queue)))
            .await
        {
            Ok(RemoteSyncOutcome::Seeded { nodes, .. }) => {
                tracing::info!("Following remote origin ({} nodes seeded)", nodes);
                seeded = true;
            }
            Ok(RemoteSyncOutcome::SelfReference) => {}
            Err(e) => tracing::warn!("Remote bootstrap failed, sourcing locally: {}", e),
        }
    }
    if !seeded {
        let sourced = source_all(&ctx).await;
        tracing::info!("Sourced {} plugins locally", sourced);
    }

    let state = AppState::new(ctx.clone(), queue.clone())
        .with_relay(WebhookRelay::new(config.webhooks.relay_destinations.clone()))
        .with_max_body_bytes(config.webhooks.max_body_bytes);
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flushed = queue.flush_all();
    tracing::info!("Flushed {} pending webhook batches", flushed);
    if let Err(e) = ctx.persist_deletions().await {
        tracing::warn!("Failed to persist deletion log: {}", e);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Followers that own a plugin reconcile its webhooks locally
fn local_webhook_callback(ctx: &SyncContext, queue: &Arc<WebhookQueue>) -> WebhookCallback {
    let ctx = ctx.clone();
    let queue = queue.clone();
    Arc::new(move |notice| {
        if ctx.plugins.get(&notice.plugin_name).is_none() {
            return false;
        }
        let raw_body = Bytes::from(serde_json::to_vec(&notice.body).unwrap_or_default());
        queue.enqueue(QueuedWebhook::new(notice.plugin_name, notice.path, raw_body));
        true
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, flushing webhooks...");
}
