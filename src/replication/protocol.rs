use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{ChangeEvent, Entity};

/// Subscription data that matches every type
pub const WILDCARD: &str = "*";

/// Frame type on the replication socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // server -> client
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "subscribed")]
    Subscribed,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "node:created")]
    NodeCreated,
    #[serde(rename = "node:updated")]
    NodeUpdated,
    #[serde(rename = "node:deleted")]
    NodeDeleted,
    #[serde(rename = "webhook:received")]
    WebhookReceived,
    #[serde(rename = "error")]
    Error,
    // client -> server
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "ping")]
    Ping,
}

/// One replication frame: `{type, nodeId, nodeType, data, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `webhook:received` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotice {
    pub plugin_name: String,
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

impl ReplicationMessage {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            node_id: None,
            node_type: None,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn subscribe(data: &str) -> Self {
        Self::new(MessageKind::Subscribe, Value::String(data.to_string()))
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, Value::String(message.into()))
    }

    fn for_node(kind: MessageKind, node: &Entity) -> Self {
        Self {
            kind,
            node_id: Some(node.id.clone()),
            node_type: Some(node.node_type.clone()),
            data: node.to_value(),
            timestamp: Utc::now(),
        }
    }

    /// Deletes carry the removed node so receivers know its owner
    pub fn from_change(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::Created(node) => Self::for_node(MessageKind::NodeCreated, node),
            ChangeEvent::Updated { node, .. } => Self::for_node(MessageKind::NodeUpdated, node),
            ChangeEvent::Deleted(node) => Self::for_node(MessageKind::NodeDeleted, node),
        }
    }

    pub fn webhook_received(notice: &WebhookNotice) -> Self {
        Self::new(
            MessageKind::WebhookReceived,
            serde_json::to_value(notice).unwrap_or(Value::Null),
        )
    }

    pub fn is_node_event(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::NodeCreated | MessageKind::NodeUpdated | MessageKind::NodeDeleted
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
