//! Replication server: fan-out of store changes to connected followers

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{MessageKind, ReplicationMessage, WILDCARD};
use crate::storage::SharedStore;

const HUB_CAPACITY: usize = 4096;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Broadcast point every connection listens on
#[derive(Clone)]
pub struct ReplicationHub {
    sender: broadcast::Sender<ReplicationMessage>,
}

impl Default for ReplicationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, message: ReplicationMessage) {
        // No connections is fine
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationMessage> {
        self.sender.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish every store mutation as a node frame
    pub fn forward_changes(&self, store: &SharedStore) -> JoinHandle<()> {
        let mut changes = store.read().subscribe();
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => hub.publish(ReplicationMessage::from_change(&event)),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Replication forwarder lagged, {} changes not broadcast", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Types a single connection asked for
#[derive(Debug, Default)]
pub struct Subscriptions {
    types: BTreeSet<String>,
}

impl Subscriptions {
    pub fn add(&mut self, node_type: &str) {
        self.types.insert(node_type.to_string());
    }

    pub fn remove(&mut self, node_type: &str) -> bool {
        self.types.remove(node_type)
    }

    pub fn list(&self) -> Vec<String> {
        self.types.iter().cloned().collect()
    }

    /// Node frames go to matching types; webhook frames to any subscriber
    pub fn wants(&self, message: &ReplicationMessage) -> bool {
        if self.types.is_empty() {
            return false;
        }
        if self.types.contains(WILDCARD) {
            return true;
        }
        match message.kind {
            MessageKind::WebhookReceived => true,
            _ if message.is_node_event() => message
                .node_type
                .as_deref()
                .map(|t| self.types.contains(t))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Subscription data may be a single type or a list of types
fn requested_types(data: &Value) -> Vec<String> {
    match data {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn text(message: &ReplicationMessage) -> Message {
    Message::Text(message.to_json().into())
}

/// Serve one follower connection until it closes
pub async fn handle_socket(socket: WebSocket, hub: ReplicationHub) {
    let conn_id = uuid::Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(1000);
    let subscriptions = Arc::new(RwLock::new(Subscriptions::default()));

    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!("[REPL] Failed to send ping, closing writer");
                        break;
                    }
                }
                Some(msg) = rx.recv() => {
                    if sender.send(msg).await.is_err() {
                        debug!("[REPL] Failed to send message, closing writer");
                        break;
                    }
                }
                else => break,
            }
        }
    });

    let mut events = hub.subscribe();
    let forward_tx = tx.clone();
    let forward_subs = subscriptions.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(message) => {
                    if !forward_subs.read().wants(&message) {
                        continue;
                    }
                    if forward_tx.send(text(&message)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("[REPL] Follower {} lagged, {} messages dropped", conn_id, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("[REPL] Follower {} connected", conn_id);
    let _ = tx
        .send(text(&ReplicationMessage::new(MessageKind::Connected, Value::Null)))
        .await;

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(body) => {
                let reply = match serde_json::from_str::<ReplicationMessage>(body.as_str()) {
                    Ok(req) => handle_request(req, &subscriptions),
                    Err(e) => ReplicationMessage::error(format!("invalid frame: {}", e)),
                };
                if tx.send(text(&reply)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("[REPL] Follower {} disconnected", conn_id);
    forward_task.abort();
    send_task.abort();
}

fn handle_request(
    req: ReplicationMessage,
    subscriptions: &RwLock<Subscriptions>,
) -> ReplicationMessage {
    match req.kind {
        MessageKind::Subscribe => {
            let types = requested_types(&req.data);
            if types.is_empty() {
                return ReplicationMessage::error("subscribe needs a type or \"*\"");
            }
            let mut subs = subscriptions.write();
            for t in &types {
                subs.add(t);
            }
            debug!("[REPL] Subscribed to {:?}", types);
            ReplicationMessage::new(MessageKind::Subscribed, Value::from(subs.list()))
        }
        MessageKind::Unsubscribe => {
            let mut subs = subscriptions.write();
            for t in requested_types(&req.data) {
                subs.remove(&t);
            }
            ReplicationMessage::new(MessageKind::Subscribed, Value::from(subs.list()))
        }
        MessageKind::Ping => ReplicationMessage::new(MessageKind::Pong, Value::Null),
        other => ReplicationMessage::error(format!("unexpected frame type {:?}", other)),
    }
}
