use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Keys managed by the store itself; they never live in `fields`.
pub const RESERVED_KEYS: [&str; 8] = [
    "id",
    "type",
    "contentDigest",
    "owner",
    "createdAt",
    "modifiedAt",
    "parent",
    "children",
];

/// A typed record with stable identity, owner and content digest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Globally unique node id
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: String,

    pub content_digest: String,

    /// Name of the source plugin that created the node
    pub owner: String,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,

    /// Arbitrary source fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create a new entity; the digest is computed from type, fields and links.
    pub fn new(
        id: impl Into<String>,
        node_type: impl Into<String>,
        owner: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let mut entity = Self {
            id: id.into(),
            node_type: node_type.into(),
            content_digest: String::new(),
            owner: owner.into(),
            created_at: now,
            modified_at: now,
            parent: None,
            children: Vec::new(),
            fields: strip_reserved(fields),
        };
        entity.refresh_digest();
        entity
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.refresh_digest();
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self.refresh_digest();
        self
    }

    /// Build an entity from a replicated payload, synthesizing whatever
    /// metadata the sender left out.
    pub fn from_remote(node_id: &str, node_type: Option<&str>, data: Value) -> Option<Self> {
        if let Ok(mut entity) = serde_json::from_value::<Entity>(data.clone()) {
            if entity.content_digest.is_empty() {
                entity.refresh_digest();
            }
            return Some(entity);
        }

        let mut obj = match data {
            Value::Object(obj) => obj,
            _ => return None,
        };

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(node_id)
            .to_string();
        let node_type = obj
            .get("type")
            .and_then(Value::as_str)
            .or(node_type)?
            .to_string();
        let owner = obj
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or("remote")
            .to_string();
        let parent = obj.get("parent").and_then(Value::as_str).map(String::from);
        let children = obj
            .get("children")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let created_at = parse_time(obj.get("createdAt"));
        let modified_at = parse_time(obj.get("modifiedAt"));

        for key in RESERVED_KEYS {
            obj.remove(key);
        }

        let mut entity = Entity::new(id, node_type, owner, obj);
        entity.parent = parent;
        entity.children = children;
        if let Some(ts) = created_at {
            entity.created_at = ts;
        }
        entity.modified_at = modified_at.unwrap_or(entity.created_at);
        entity.refresh_digest();
        Some(entity)
    }

    /// Recompute the content digest from the current content
    pub fn refresh_digest(&mut self) {
        self.content_digest = create_content_digest(&self.digest_input());
    }

    fn digest_input(&self) -> Value {
        serde_json::json!({
            "type": self.node_type,
            "parent": self.parent,
            "children": self.children,
            "fields": Value::Object(self.fields.clone()),
        })
    }

    /// Get a field, including the reserved ones
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.node_type.clone())),
            "owner" => Some(Value::String(self.owner.clone())),
            "contentDigest" => Some(Value::String(self.content_digest.clone())),
            "parent" => self.parent.clone().map(Value::String),
            _ => self.fields.get(field).cloned(),
        }
    }

    /// Convert to JSON value including metadata
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn strip_reserved(mut fields: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_KEYS {
        fields.remove(key);
    }
    fields
}

/// Deterministic, key-order-independent SHA-256 digest of a JSON value
pub fn create_content_digest(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
