//! Cross-entity reference resolution
//!
//! Plugins describe what their reference markers look like; the registry
//! resolves them against the store at read time. Nothing is materialized, so
//! a reference to a node that has not been sourced yet simply stays a marker.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::storage::{Entity, EntityStore};

/// Default recursion ceiling for reference chains
pub const DEFAULT_MAX_DEPTH: usize = 5;

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type LookupExtractor = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;
type TypesExtractor = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// A plugin-supplied description of one reference marker shape
#[derive(Clone)]
pub struct ReferenceResolver {
    pub id: String,
    /// Field whose presence marks a value as a reference
    pub marker_field: String,
    /// Entity field the lookup value is matched against
    pub lookup_field: String,
    pub priority: i32,
    is_reference: Predicate,
    get_lookup_value: LookupExtractor,
    get_possible_types: TypesExtractor,
}

impl fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("id", &self.id)
            .field("marker_field", &self.marker_field)
            .field("lookup_field", &self.lookup_field)
            .field("priority", &self.priority)
            .finish()
    }
}

impl ReferenceResolver {
    /// A resolver that treats any object carrying `marker_field` as a
    /// reference, using the marker's value as the lookup value and an
    /// optional `__typename`/`type` hint as the candidate type.
    pub fn new(
        id: impl Into<String>,
        marker_field: impl Into<String>,
        lookup_field: impl Into<String>,
    ) -> Self {
        let marker_field = marker_field.into();
        let marker_check = marker_field.clone();
        let marker_lookup = marker_field.clone();

        Self {
            id: id.into(),
            marker_field,
            lookup_field: lookup_field.into(),
            priority: 0,
            is_reference: Arc::new(move |v| v.get(&marker_check).is_some()),
            get_lookup_value: Arc::new(move |v| v.get(&marker_lookup).cloned()),
            get_possible_types: Arc::new(|v| {
                v.get("__typename")
                    .or_else(|| v.get("type"))
                    .and_then(Value::as_str)
                    .map(|t| vec![t.to_string()])
                    .unwrap_or_default()
            }),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.is_reference = Arc::new(f);
        self
    }

    pub fn with_lookup<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.get_lookup_value = Arc::new(f);
        self
    }

    pub fn with_possible_types<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        self.get_possible_types = Arc::new(f);
        self
    }

    pub fn is_reference(&self, value: &Value) -> bool {
        value.is_object() && (self.is_reference)(value)
    }

    pub fn lookup_value(&self, value: &Value) -> Option<Value> {
        (self.get_lookup_value)(value)
    }

    pub fn possible_types(&self, value: &Value) -> Vec<String> {
        (self.get_possible_types)(value)
    }
}

/// Depth bookkeeping for a resolution chain
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub depth: usize,
    pub max_depth: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl ResolveOptions {
    fn deeper(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }
}

/// Priority-ordered resolver list; first match wins
#[derive(Debug, Default, Clone)]
pub struct ReferenceRegistry {
    resolvers: Vec<ReferenceResolver>,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver. An existing resolver with the same id is replaced.
    pub fn register(&mut self, resolver: ReferenceResolver) {
        if let Some(existing) = self.resolvers.iter_mut().find(|r| r.id == resolver.id) {
            *existing = resolver;
        } else {
            self.resolvers.push(resolver);
        }
        // Stable sort keeps registration order among equal priorities
        self.resolvers.sort_by_key(|r| Reverse(r.priority));
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        let before = self.resolvers.len();
        self.resolvers.retain(|r| r.id != id);
        before != self.resolvers.len()
    }

    pub fn resolvers(&self) -> &[ReferenceResolver] {
        &self.resolvers
    }

    pub fn clear(&mut self) {
        self.resolvers.clear();
    }

    pub fn find_resolver(&self, value: &Value) -> Option<&ReferenceResolver> {
        self.resolvers.iter().find(|r| r.is_reference(value))
    }

    pub fn is_reference(&self, value: &Value) -> bool {
        self.find_resolver(value).is_some()
    }

    /// Resolve a single reference marker to the entity it points at
    pub fn resolve_reference(
        &self,
        store: &EntityStore,
        reference: &Value,
        opts: ResolveOptions,
    ) -> Option<Entity> {
        if opts.depth >= opts.max_depth {
            trace!("Reference depth {} reached, giving up", opts.depth);
            return None;
        }

        let resolver = self.find_resolver(reference)?;
        let lookup = resolver.lookup_value(reference)?;

        let candidates = resolver.possible_types(reference);
        for node_type in &candidates {
            if let Some(found) = store.find_by_field(node_type, &resolver.lookup_field, &lookup) {
                return Some(found.clone());
            }
        }

        let tried: HashSet<&String> = candidates.iter().collect();
        store
            .types()
            .iter()
            .filter(|t| !tried.contains(t))
            .find_map(|t| store.find_by_field(t, &resolver.lookup_field, &lookup))
            .cloned()
    }

    /// Replace every reference inside `value` with the entity it resolves to,
    /// following references inside resolved entities up to `max_depth` hops.
    pub fn resolve_deep(&self, store: &EntityStore, value: &Value, opts: ResolveOptions) -> Value {
        match value {
            Value::Object(map) => {
                if self.is_reference(value) {
                    return match self.resolve_reference(store, value, opts) {
                        Some(entity) => self.resolve_deep(store, &entity.to_value(), opts.deeper()),
                        None => value.clone(),
                    };
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), self.resolve_deep(store, v, opts)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_deep(store, v, opts))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_resolver_shape() {
        let resolver = ReferenceResolver::new("link", "__ref", "sourceId");
        let value = json!({"__ref": "abc", "__typename": "Post"});
        assert!(resolver.is_reference(&value));
        assert_eq!(resolver.lookup_value(&value), Some(json!("abc")));
        assert_eq!(resolver.possible_types(&value), vec!["Post".to_string()]);
        assert!(!resolver.is_reference(&json!("__ref")));
    }

    #[test]
    fn test_replacing_keeps_single_entry() {
        let mut registry = ReferenceRegistry::new();
        registry.register(ReferenceResolver::new("a", "x", "y"));
        registry.register(ReferenceResolver::new("a", "z", "y").with_priority(3));
        assert_eq!(registry.resolvers().len(), 1);
        assert_eq!(registry.resolvers()[0].marker_field, "z");
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
    }
}
