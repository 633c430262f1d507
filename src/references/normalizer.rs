//! Response normalization
//!
//! Walks a response tree depth-first and hoists every recognizable entity into
//! a flat `$entities` map, leaving `{"$ref": key}` behind. An entity that
//! appears many times in one response is stored once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const REF_KEY: &str = "$ref";
pub const ENTITIES_KEY: &str = "$entities";

/// How to build the cache key for one type
#[derive(Debug, Clone)]
pub struct EntityKeyConfig {
    pub type_name: String,
    pub key_fields: Vec<String>,
}

impl EntityKeyConfig {
    pub fn new(type_name: impl Into<String>, key_fields: &[&str]) -> Self {
        Self {
            type_name: type_name.into(),
            key_fields: key_fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// `{data, $entities}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub data: Value,
    #[serde(rename = "$entities")]
    pub entities: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    configs: HashMap<String, EntityKeyConfig>,
    typename_field: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            configs: HashMap::new(),
            typename_field: "__typename".to_string(),
        }
    }

    pub fn with_typename_field(mut self, field: impl Into<String>) -> Self {
        self.typename_field = field.into();
        self
    }

    pub fn register(&mut self, config: EntityKeyConfig) {
        self.configs.insert(config.type_name.clone(), config);
    }

    /// Cache key for an object, if it is an entity
    pub fn entity_key(&self, obj: &Map<String, Value>) -> Option<String> {
        let type_name = obj
            .get(&self.typename_field)
            .or_else(|| obj.get("type"))
            .and_then(Value::as_str)?;

        if let Some(config) = self.configs.get(type_name) {
            let mut parts = Vec::with_capacity(config.key_fields.len() + 1);
            parts.push(type_name.to_string());
            for field in &config.key_fields {
                parts.push(scalar_string(obj.get(field)?)?);
            }
            return Some(parts.join(":"));
        }

        // Fallback: type:id
        let id = scalar_string(obj.get("id")?)?;
        Some(format!("{}:{}", type_name, id))
    }

    pub fn normalize(&self, response: &Value) -> NormalizedResponse {
        let mut entities = Map::new();
        let data = self.walk(response, &mut entities);
        NormalizedResponse { data, entities }
    }

    fn walk(&self, value: &Value, entities: &mut Map<String, Value>) -> Value {
        match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.walk(v, entities)).collect())
            }
            Value::Object(obj) => {
                let normalized: Map<String, Value> = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), self.walk(v, entities)))
                    .collect();

                match self.entity_key(obj) {
                    Some(key) => {
                        match entities.get_mut(&key) {
                            Some(Value::Object(existing)) => {
                                // Later occurrences only fill in missing fields
                                for (k, v) in normalized {
                                    existing.entry(k).or_insert(v);
                                }
                            }
                            _ => {
                                entities.insert(key.clone(), Value::Object(normalized));
                            }
                        }
                        let mut reference = Map::new();
                        reference.insert(REF_KEY.to_string(), Value::String(key));
                        Value::Object(reference)
                    }
                    None => Value::Object(normalized),
                }
            }
            other => other.clone(),
        }
    }
}

/// Rebuild the original tree from a normalized response.
/// A `$ref` that points back into its own expansion is left as a ref.
pub fn denormalize(normalized: &NormalizedResponse) -> Value {
    let mut visiting = HashSet::new();
    expand(&normalized.data, &normalized.entities, &mut visiting)
}

fn expand(value: &Value, entities: &Map<String, Value>, visiting: &mut HashSet<String>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand(v, entities, visiting))
                .collect(),
        ),
        Value::Object(obj) => {
            if let Some(key) = ref_key(obj) {
                if visiting.contains(key) {
                    return value.clone();
                }
                if let Some(entity) = entities.get(key) {
                    visiting.insert(key.to_string());
                    let expanded = expand(entity, entities, visiting);
                    visiting.remove(key);
                    return expanded;
                }
                return value.clone();
            }
            Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), expand(v, entities, visiting)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn ref_key(obj: &Map<String, Value>) -> Option<&str> {
    if obj.len() == 1 {
        obj.get(REF_KEY).and_then(Value::as_str)
    } else {
        None
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
