use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        // Pull-based catch-up
        .route("/_sync", get(get_sync))
        // Webhook ingestion
        .route(
            "/_webhooks/{plugin}/{*path}",
            post(receive_webhook).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        // Live replication
        .route("/_ws", get(replication_ws))
        // Reads
        .route("/_nodes", get(list_nodes))
        .route("/_nodes/{id}", get(get_node))
        .route("/_health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        )
}
