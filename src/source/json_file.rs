use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::{SourceActions, SourcePlugin, SyncStrategy};
use crate::error::{SyncError, SyncResult};
use crate::storage::Entity;

/// Field that keeps the item's own id once it becomes a node
pub const SOURCE_ID_FIELD: &str = "sourceId";

/// Sources nodes from a JSON file holding an array of items or `{"items": [...]}`.
///
/// Every item needs an `id` and a `type` (or the configured default type).
pub struct JsonFileSource {
    name: String,
    path: PathBuf,
    default_type: Option<String>,
    seen_types: RwLock<BTreeSet<String>>,
}

impl JsonFileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            default_type: None,
            seen_types: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn with_default_type(mut self, node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        self.seen_types.write().insert(node_type.clone());
        self.default_type = Some(node_type);
        self
    }

    async fn read_items(&self) -> SyncResult<Vec<Value>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            SyncError::plugin(&self.name, format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::plugin(&self.name, format!("invalid JSON: {}", e)))?;

        match doc {
            Value::Array(items) => Ok(items),
            Value::Object(mut obj) => match obj.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(SyncError::plugin(&self.name, "expected an `items` array")),
            },
            _ => Err(SyncError::plugin(&self.name, "expected an array of items")),
        }
    }
}

#[async_trait]
impl SourcePlugin for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> SyncStrategy {
        SyncStrategy::Sync
    }

    fn node_types(&self) -> Vec<String> {
        self.seen_types.read().iter().cloned().collect()
    }

    async fn source_nodes(&self, actions: &SourceActions, _options: &Value) -> SyncResult<()> {
        let items = self.read_items().await?;
        let mut types = BTreeSet::new();

        for item in items {
            let Value::Object(mut fields) = item else {
                warn!("{}: skipping non-object item", self.name);
                continue;
            };

            let source_id = match fields.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    warn!("{}: skipping item without id", self.name);
                    continue;
                }
            };
            let node_type = match fields
                .get("type")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| self.default_type.clone())
            {
                Some(t) => t,
                None => {
                    warn!("{}: skipping item {} without type", self.name, source_id);
                    continue;
                }
            };

            fields.insert(SOURCE_ID_FIELD.to_string(), Value::String(source_id.clone()));
            let id = actions.create_node_id(&format!("{}:{}", node_type, source_id));
            actions.create_node(Entity::new(id, node_type.as_str(), self.name.as_str(), fields))?;
            types.insert(node_type);
        }

        debug!("{}: read {} types from {}", self.name, types.len(), self.path.display());
        if let Some(default_type) = &self.default_type {
            types.insert(default_type.clone());
        }
        *self.seen_types.write() = types;
        Ok(())
    }
}
