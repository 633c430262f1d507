use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::references::ResolveOptions;
use crate::server::state::AppState;
use crate::storage::Entity;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    /// Return `{data, $entities}` instead of a plain list
    #[serde(default)]
    pub normalize: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetParams {
    #[serde(default)]
    pub resolve: bool,
}

/// GET /_nodes?type=T
pub async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Value> {
    let nodes: Vec<Entity> = {
        let store = state.ctx.store.read();
        match &params.node_type {
            Some(t) => store.get_by_type(t).into_iter().cloned().collect(),
            None => {
                let mut all: Vec<Entity> = store.get_all().into_iter().cloned().collect();
                all.sort_by(|a, b| a.id.cmp(&b.id));
                all
            }
        }
    };

    let count = nodes.len();
    let data = Value::Array(nodes.iter().map(Entity::to_value).collect());
    if params.normalize {
        let normalized = state.ctx.normalizer.read().normalize(&data);
        return Json(json!({ "count": count, "result": normalized }));
    }
    Json(json!({ "count": count, "result": data }))
}

/// GET /_nodes/{id}?resolve=true
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<GetParams>,
) -> Result<Json<Value>, SyncError> {
    let store = state.ctx.store.read();
    let node = store
        .get(&id)
        .ok_or_else(|| SyncError::NodeNotFound(id.clone()))?;

    let mut value = node.to_value();
    if params.resolve {
        let references = state.ctx.references.read();
        if let Value::Object(map) = &mut value {
            for field in map.values_mut() {
                *field = references.resolve_deep(&store, field, ResolveOptions::default());
            }
        }
    }
    Ok(Json(value))
}

/// GET /_health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let (nodes, types) = {
        let store = state.ctx.store.read();
        (store.len(), store.count_by_type())
    };
    let tombstones = state.ctx.deletions.read().stats();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": nodes,
        "types": types,
        "tombstones": tombstones.total_entries,
        "followers": state.ctx.hub.connection_count(),
        "sources": state.ctx.plugins.names(),
    }))
}
