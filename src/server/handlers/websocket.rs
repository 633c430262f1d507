use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
};

use crate::replication::handle_socket;
use crate::server::state::AppState;

/// GET /_ws: replication feed for followers
pub async fn replication_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.ctx.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}
