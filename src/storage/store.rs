use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use super::entity::Entity;

/// Capacity of the change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 4096;

/// Store shared between the context, the webhook processor and replication
pub type SharedStore = Arc<RwLock<EntityStore>>;

/// Kind of mutation carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Real-time change event
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created(Entity),
    Updated { node: Entity, previous: Entity },
    Deleted(Entity),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Created(_) => ChangeKind::Created,
            ChangeEvent::Updated { .. } => ChangeKind::Updated,
            ChangeEvent::Deleted(_) => ChangeKind::Deleted,
        }
    }

    /// The node after the change, or the removed node for deletions
    pub fn node(&self) -> &Entity {
        match self {
            ChangeEvent::Created(node) | ChangeEvent::Deleted(node) => node,
            ChangeEvent::Updated { node, .. } => node,
        }
    }
}

/// Indexed in-memory entity store
///
/// Primary map is id -> entity. Every id also sits in exactly one type bucket
/// matching its current type; buckets are dropped as soon as they are empty.
/// Declared field indexes map `type -> field -> value -> id`.
pub struct EntityStore {
    nodes: HashMap<String, Entity>,
    by_type: HashMap<String, BTreeSet<String>>,
    indexes: HashMap<String, HashMap<String, HashMap<String, String>>>,
    pub change_sender: broadcast::Sender<ChangeEvent>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (change_sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            nodes: HashMap::new(),
            by_type: HashMap::new(),
            indexes: HashMap::new(),
            change_sender,
        }
    }

    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Upsert an entity, moving it between type buckets if its type changed
    pub fn set(&mut self, entity: Entity) {
        let previous = self.nodes.remove(&entity.id);
        if let Some(prev) = &previous {
            self.unlink(prev);
        }

        self.by_type
            .entry(entity.node_type.clone())
            .or_default()
            .insert(entity.id.clone());
        self.index_entity(&entity);
        self.nodes.insert(entity.id.clone(), entity.clone());

        let event = match previous {
            Some(previous) => ChangeEvent::Updated {
                node: entity,
                previous,
            },
            None => ChangeEvent::Created(entity),
        };
        let _ = self.change_sender.send(event);
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All entities of a type, ordered by id
    pub fn get_by_type(&self, node_type: &str) -> Vec<&Entity> {
        self.by_type
            .get(node_type)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_all(&self) -> Vec<&Entity> {
        self.nodes.values().collect()
    }

    /// Remove an entity. Returns false when the id was unknown.
    pub fn delete(&mut self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    /// Remove an entity and hand back what was stored
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let entity = self.nodes.remove(id)?;
        self.unlink(&entity);
        let _ = self.change_sender.send(ChangeEvent::Deleted(entity.clone()));
        Some(entity)
    }

    pub fn count_by_type(&self) -> HashMap<String, usize> {
        self.by_type
            .iter()
            .map(|(t, ids)| (t.clone(), ids.len()))
            .collect()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every entity. Declared indexes stay declared but empty.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_type.clear();
        for fields in self.indexes.values_mut() {
            for values in fields.values_mut() {
                values.clear();
            }
        }
    }

    /// Declare a lookup index on `field` for entities of `node_type`
    pub fn register_index(&mut self, node_type: &str, field: &str) {
        let fields = self.indexes.entry(node_type.to_string()).or_default();
        if fields.contains_key(field) {
            return;
        }

        let mut values = HashMap::new();
        if let Some(ids) = self.by_type.get(node_type) {
            for id in ids {
                if let Some(key) = self.nodes.get(id).and_then(|e| e.get(field)).and_then(|v| value_key(&v)) {
                    values.insert(key, id.clone());
                }
            }
        }
        fields.insert(field.to_string(), values);
    }

    pub fn indexed_fields(&self, node_type: &str) -> Vec<String> {
        let mut fields: Vec<String> = self
            .indexes
            .get(node_type)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        fields.sort();
        fields
    }

    /// Look up an entity of `node_type` whose `field` equals `value`
    pub fn find_by_field(&self, node_type: &str, field: &str, value: &Value) -> Option<&Entity> {
        let key = value_key(value)?;
        if let Some(values) = self.indexes.get(node_type).and_then(|f| f.get(field)) {
            return values.get(&key).and_then(|id| self.nodes.get(id));
        }

        self.get_by_type(node_type)
            .into_iter()
            .find(|e| e.get(field).and_then(|v| value_key(&v)).as_deref() == Some(key.as_str()))
    }

    fn index_entity(&mut self, entity: &Entity) {
        if let Some(fields) = self.indexes.get_mut(&entity.node_type) {
            for (field, values) in fields.iter_mut() {
                if let Some(key) = entity.get(field).and_then(|v| value_key(&v)) {
                    values.insert(key, entity.id.clone());
                }
            }
        }
    }

    fn unlink(&mut self, entity: &Entity) {
        if let Some(ids) = self.by_type.get_mut(&entity.node_type) {
            ids.remove(&entity.id);
            if ids.is_empty() {
                self.by_type.remove(&entity.node_type);
            }
        }

        if let Some(fields) = self.indexes.get_mut(&entity.node_type) {
            for (field, values) in fields.iter_mut() {
                if let Some(key) = entity.get(field).and_then(|v| value_key(&v)) {
                    if values.get(&key) == Some(&entity.id) {
                        values.remove(&key);
                    }
                }
            }
        }
    }
}

/// Index key for a scalar value; objects, arrays and null are not indexable
fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, node_type: &str, slug: &str) -> Entity {
        Entity::new(id, node_type, "cms", json!({"slug": slug}).as_object().unwrap().clone())
    }

    #[test]
    fn test_index_tracks_type_change() {
        let mut store = EntityStore::new();
        store.register_index("Post", "slug");
        store.set(entity("1", "Post", "hello"));
        assert!(store.find_by_field("Post", "slug", &json!("hello")).is_some());

        store.set(entity("1", "Page", "hello"));
        assert!(store.find_by_field("Post", "slug", &json!("hello")).is_none());
        assert!(store.by_type.get("Post").is_none());
        assert_eq!(store.get_by_type("Page").len(), 1);
    }

    #[test]
    fn test_value_key_scalars_only() {
        assert_eq!(value_key(&json!(42)), Some("42".to_string()));
        assert_eq!(value_key(&json!(true)), Some("true".to_string()));
        assert_eq!(value_key(&json!(null)), None);
        assert_eq!(value_key(&json!({"a": 1})), None);
    }
}
