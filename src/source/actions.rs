use std::collections::HashSet;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::storage::{create_content_digest, Entity, RESERVED_KEYS};

/// Store operations handed to a source plugin, bound to its owner tag.
///
/// Tracks which ids a run created or confirmed so that a full reconciliation
/// can remove whatever the source no longer produces.
pub struct SourceActions {
    ctx: SyncContext,
    owner: String,
    namespace: Uuid,
    node_types: Vec<String>,
    seen: Mutex<HashSet<String>>,
    touched: Mutex<HashSet<String>>,
}

impl SourceActions {
    pub fn new(ctx: SyncContext, owner: impl Into<String>, node_types: Vec<String>) -> Self {
        let owner = owner.into();
        Self {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, owner.as_bytes()),
            ctx,
            owner,
            node_types,
            seen: Mutex::new(HashSet::new()),
            touched: Mutex::new(HashSet::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Deterministic node id for a source-local seed, namespaced by owner
    pub fn create_node_id(&self, seed: &str) -> String {
        Uuid::new_v5(&self.namespace, seed.as_bytes()).to_string()
    }

    pub fn create_content_digest(&self, value: &Value) -> String {
        create_content_digest(value)
    }

    /// Upsert a node under this owner. A node whose digest is unchanged is
    /// left untouched, so re-sourcing is idempotent.
    pub fn create_node(&self, node: Entity) -> SyncResult<Entity> {
        let mut node = node;
        node.owner = self.owner.clone();
        node.refresh_digest();

        let mut store = self.ctx.store.write();
        if let Some(existing) = store.get(&node.id) {
            if existing.owner != self.owner {
                return Err(SyncError::Conflict(format!(
                    "node {} is owned by {}, not {}",
                    node.id, existing.owner, self.owner
                )));
            }
            if existing.content_digest == node.content_digest {
                trace!("Node {} unchanged, skipping", node.id);
                self.seen.lock().insert(node.id.clone());
                return Ok(existing.clone());
            }
            node.created_at = existing.created_at;
        }

        node.modified_at = Utc::now();
        store.set(node.clone());
        drop(store);

        self.seen.lock().insert(node.id.clone());
        self.touch();
        Ok(node)
    }

    /// Merge extra fields into an existing node
    pub fn extend_node(&self, id: &str, fields: Map<String, Value>) -> SyncResult<Entity> {
        let mut store = self.ctx.store.write();
        let mut node = store
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NodeNotFound(id.to_string()))?;

        let before = node.content_digest.clone();
        for (key, value) in fields {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                node.fields.insert(key, value);
            }
        }
        node.refresh_digest();
        if node.content_digest == before {
            return Ok(node);
        }

        node.modified_at = Utc::now();
        store.set(node.clone());
        drop(store);

        self.touch_owner(&node.owner);
        Ok(node)
    }

    pub fn delete_node(&self, id: &str) -> bool {
        match self.ctx.remove_node(id) {
            Some(removed) => {
                self.touch_owner(&removed.owner);
                true
            }
            None => false,
        }
    }

    /// Delete a node when only its source id is known. The node type is not
    /// part of the event, so every type this plugin produces is tried.
    pub fn delete_by_source_id(&self, source_id: &str) -> Option<String> {
        for node_type in &self.node_types {
            let id = self.create_node_id(&format!("{}:{}", node_type, source_id));
            let owned = self
                .ctx
                .store
                .read()
                .get(&id)
                .map(|n| n.owner == self.owner)
                .unwrap_or(false);
            if owned && self.delete_node(&id) {
                debug!("Deleted {} ({}) for source id {}", id, node_type, source_id);
                return Some(id);
            }
        }
        None
    }

    pub fn get_node(&self, id: &str) -> Option<Entity> {
        self.ctx.store.read().get(id).cloned()
    }

    /// Every node owned by this plugin
    pub fn get_nodes(&self) -> Vec<Entity> {
        let store = self.ctx.store.read();
        let mut nodes: Vec<Entity> = store
            .get_all()
            .into_iter()
            .filter(|n| n.owner == self.owner)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn get_nodes_by_type(&self, node_type: &str) -> Vec<Entity> {
        self.ctx
            .store
            .read()
            .get_by_type(node_type)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Owners whose nodes changed during this run
    pub fn touched_owners(&self) -> HashSet<String> {
        self.touched.lock().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Remove this owner's nodes that the run neither created nor confirmed
    pub(crate) fn remove_stale(&self) -> usize {
        let seen = self.seen.lock().clone();
        let stale: Vec<String> = self
            .get_nodes()
            .into_iter()
            .filter(|n| !seen.contains(&n.id))
            .map(|n| n.id)
            .collect();

        for id in &stale {
            self.delete_node(id);
        }
        if !stale.is_empty() {
            debug!("Removed {} stale nodes for {}", stale.len(), self.owner);
        }
        stale.len()
    }

    fn touch(&self) {
        self.touch_owner(&self.owner);
    }

    fn touch_owner(&self, owner: &str) {
        self.touched.lock().insert(owner.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DeletionLogConfig;
    use serde_json::json;

    fn ctx() -> (SyncContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SyncContext::new(dir.path(), DeletionLogConfig::default()), dir)
    }

    #[test]
    fn test_node_ids_are_namespaced_by_owner() {
        let (ctx, _dir) = ctx();
        let a = SourceActions::new(ctx.clone(), "cms", vec![]);
        let b = SourceActions::new(ctx, "shop", vec![]);
        assert_eq!(a.create_node_id("Post:1"), a.create_node_id("Post:1"));
        assert_ne!(a.create_node_id("Post:1"), b.create_node_id("Post:1"));
    }

    #[test]
    fn test_unchanged_node_is_not_rewritten() {
        let (ctx, _dir) = ctx();
        let actions = SourceActions::new(ctx.clone(), "cms", vec![]);
        let fields = json!({"title": "A"}).as_object().unwrap().clone();

        let first = actions.create_node(Entity::new("n1", "Post", "cms", fields.clone())).unwrap();
        let mut events = ctx.store.read().subscribe();
        let second = actions.create_node(Entity::new("n1", "Post", "cms", fields)).unwrap();

        assert_eq!(first.modified_at, second.modified_at);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_foreign_owner_is_rejected() {
        let (ctx, _dir) = ctx();
        ctx.store.write().set(Entity::new("n1", "Post", "other", Map::new()));
        let actions = SourceActions::new(ctx, "cms", vec![]);
        let err = actions.create_node(Entity::new("n1", "Post", "cms", Map::new()));
        assert!(matches!(err, Err(SyncError::Conflict(_))));
    }
}
