//! Replication client: keeps a follower's store in step with an origin

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::protocol::{MessageKind, ReplicationMessage, WebhookNotice, WILDCARD};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::storage::Entity;
use crate::sync::remote::{apply_seed, fetch_remote_nodes};

/// Invoked with each `webhook:received` frame. Returns true when the follower
/// processes that plugin's webhooks itself.
pub type WebhookCallback = Arc<dyn Fn(WebhookNotice) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReplicationClientConfig {
    /// HTTP base URL of the origin
    pub remote: Url,
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub keepalive: Duration,
    pub resync_on_reconnect: bool,
}

impl ReplicationClientConfig {
    pub fn new(remote: Url) -> Self {
        Self {
            remote,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
            keepalive: Duration::from_secs(30),
            resync_on_reconnect: true,
        }
    }
}

/// `endpoint` resolved under the origin's base URL, keeping any path prefix
pub fn origin_endpoint(remote: &Url, endpoint: &str) -> SyncResult<Url> {
    let mut base = remote.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(endpoint)?)
}

/// `ws(s)://host:port/<prefix>/_ws` for an origin's HTTP base URL
pub fn websocket_url(remote: &Url) -> SyncResult<Url> {
    let mut url = origin_endpoint(remote, "_ws")?;
    let scheme = match remote.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot derive websocket url from {}", remote)))?;
    Ok(url)
}

pub struct ReplicationClient {
    ctx: SyncContext,
    config: ReplicationClientConfig,
    http: reqwest::Client,
    on_webhook: Option<WebhookCallback>,
}

impl ReplicationClient {
    pub fn new(ctx: SyncContext, config: ReplicationClientConfig) -> Self {
        Self {
            ctx,
            config,
            http: reqwest::Client::new(),
            on_webhook: None,
        }
    }

    pub fn with_webhook_callback(mut self, callback: WebhookCallback) -> Self {
        self.on_webhook = Some(callback);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect and reconnect until the attempt ceiling is reached
    pub async fn run(self) {
        let mut attempts: u32 = 0;
        let mut connected_once = false;

        loop {
            let mut connected = false;
            let resync = connected_once && self.config.resync_on_reconnect;
            let result = self.session(resync, &mut connected).await;

            if connected {
                attempts = 0;
                connected_once = true;
            }
            match result {
                Ok(()) => info!("[REPL] Connection to {} closed", self.config.remote),
                Err(e) => warn!("[REPL] Connection to {} failed: {}", self.config.remote, e),
            }

            attempts += 1;
            if let Some(max) = self.config.max_reconnect_attempts {
                if attempts > max {
                    error!(
                        "[REPL] Giving up on {} after {} attempts",
                        self.config.remote, max
                    );
                    break;
                }
            }

            info!(
                "[REPL] Reconnecting in {:?} (attempt {})",
                self.config.reconnect_delay, attempts
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn session(&self, resync: bool, connected: &mut bool) -> SyncResult<()> {
        let url = websocket_url(&self.config.remote)?;
        debug!("[REPL] Connecting to {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        *connected = true;
        info!("[REPL] Connected to {}", url);

        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(ReplicationMessage::subscribe(WILDCARD).to_json().into()))
            .await?;

        // Frames missed while disconnected are not replayed. Subscribing first
        // means changes made during the pull queue on the socket and apply
        // after the seed.
        if resync {
            self.resync().await;
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.tick().await;
        let mut handled = HashSet::new();

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    write
                        .send(Message::Text(ReplicationMessage::ping().to_json().into()))
                        .await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ReplicationMessage>(text.as_str()) {
                            Ok(msg) => {
                                apply_message(&self.ctx, msg, &mut handled, self.on_webhook.as_ref()).await;
                            }
                            Err(e) => debug!("[REPL] Ignoring unparseable frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    async fn resync(&self) {
        match fetch_remote_nodes(&self.http, &self.config.remote).await {
            Ok(delta) => match apply_seed(&self.ctx, delta).await {
                Ok(n) => info!("[REPL] Resynced {} nodes after reconnect", n),
                Err(e) => warn!("[REPL] Failed to apply resync: {}", e),
            },
            Err(e) => warn!("[REPL] Resync pull failed: {}", e),
        }
    }
}

/// Apply one frame to the local store. `handled` collects plugins whose
/// webhooks this follower processes itself; node frames for those owners are
/// skipped since local reconciliation will produce them. Returns the owner
/// whose cache was re-saved, if any.
pub async fn apply_message(
    ctx: &SyncContext,
    msg: ReplicationMessage,
    handled: &mut HashSet<String>,
    on_webhook: Option<&WebhookCallback>,
) -> Option<String> {
    let mut deleted = false;

    let owner = match msg.kind {
        MessageKind::NodeCreated | MessageKind::NodeUpdated => {
            let Some(node_id) = msg.node_id.as_deref() else {
                warn!("[REPL] Node frame without nodeId");
                return None;
            };
            let Some(entity) = Entity::from_remote(node_id, msg.node_type.as_deref(), msg.data)
            else {
                warn!("[REPL] Cannot build node {} from frame", node_id);
                return None;
            };
            if handled.contains(&entity.owner) {
                trace!("[REPL] Skipping {} owned by locally handled {}", entity.id, entity.owner);
                return None;
            }
            let owner = entity.owner.clone();
            ctx.store.write().set(entity);
            Some(owner)
        }
        MessageKind::NodeDeleted => {
            let node_id = msg.node_id?;
            let prior_owner = ctx
                .store
                .read()
                .get(&node_id)
                .map(|n| n.owner.clone())?;
            if handled.contains(&prior_owner) {
                trace!("[REPL] Skipping delete of {} owned by {}", node_id, prior_owner);
                return None;
            }
            deleted = true;
            ctx.remove_node(&node_id).map(|removed| removed.owner)
        }
        MessageKind::WebhookReceived => {
            if let Some(callback) = on_webhook {
                match serde_json::from_value::<WebhookNotice>(msg.data) {
                    Ok(notice) => {
                        let plugin = notice.plugin_name.clone();
                        if callback(notice) {
                            handled.insert(plugin);
                        }
                    }
                    Err(e) => warn!("[REPL] Malformed webhook notice: {}", e),
                }
            }
            None
        }
        MessageKind::Error => {
            warn!("[REPL] Origin reported: {}", msg.data);
            None
        }
        other => {
            trace!("[REPL] Received {:?}", other);
            None
        }
    };

    let owner = owner?;
    if let Err(e) = ctx.cache.save_plugin_cache(&owner, None).await {
        warn!("[REPL] Failed to save cache for {}: {}", owner, e);
    }
    if deleted {
        if let Err(e) = ctx.persist_deletions().await {
            warn!("[REPL] Failed to persist deletion log: {}", e);
        }
    }
    Some(owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        let url = websocket_url(&Url::parse("http://origin:4000?x=1").unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://origin:4000/_ws");

        let url = websocket_url(&Url::parse("https://origin.example.com").unwrap()).unwrap();
        assert_eq!(url.as_str(), "wss://origin.example.com/_ws");
    }

    #[test]
    fn test_endpoints_keep_path_prefix() {
        let remote = Url::parse("https://proxy.example.com/content").unwrap();
        assert_eq!(
            origin_endpoint(&remote, "_sync").unwrap().as_str(),
            "https://proxy.example.com/content/_sync"
        );
        assert_eq!(
            websocket_url(&remote).unwrap().as_str(),
            "wss://proxy.example.com/content/_ws"
        );

        let remote = Url::parse("http://origin:4000/content/?token=abc").unwrap();
        assert_eq!(
            origin_endpoint(&remote, "_sync").unwrap().as_str(),
            "http://origin:4000/content/_sync"
        );
    }
}
