use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::error::SyncError;
use crate::server::state::AppState;
use crate::sync::{compute_delta, parse_since, parse_types, DeltaResponse};

#[derive(Debug, Deserialize)]
pub struct SyncParams {
    pub since: Option<String>,
    pub types: Option<String>,
}

/// GET /_sync?since=<ISO8601>&types=T1,T2
pub async fn get_sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
) -> Result<Json<DeltaResponse>, SyncError> {
    let since = parse_since(params.since.as_deref())?;
    let types = parse_types(params.types.as_deref());

    // Captured before reading so a follower using it as its next `since`
    // cannot miss a concurrent write
    let server_time = Utc::now();
    let response = {
        let store = state.ctx.store.read();
        let log = state.ctx.deletions.read();
        compute_delta(&store, &log, since, types.as_ref(), server_time)
    };

    debug!(
        "Delta since {}: {} updated, {} deleted",
        since,
        response.updated.len(),
        response.deleted.len()
    );
    Ok(Json(response))
}
