use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, State},
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::replication::{ReplicationMessage, WebhookNotice};
use crate::server::state::AppState;
use crate::webhooks::{InterceptOutcome, QueuedWebhook, SIGNATURE_HEADER};

/// POST /_webhooks/{plugin}/{*path}
///
/// Validates and enqueues; reconciliation happens after the debounce window.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((plugin, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, SyncError> {
    let path = path.trim_matches('/').to_string();
    let handler = state
        .ctx
        .webhooks
        .lookup(&plugin, &path)
        .ok_or_else(|| SyncError::NotFound(format!("no webhook target {}/{}", plugin, path)))?;

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared {
        if len > state.max_body_bytes {
            return Err(SyncError::PayloadTooLarge(format!(
                "{} bytes exceeds {}",
                len, state.max_body_bytes
            )));
        }
    }
    let raw_body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            SyncError::PayloadTooLarge(format!("body exceeds {} bytes", state.max_body_bytes))
        } else {
            SyncError::BadRequest(format!("cannot read webhook body: {}", rejection.body_text()))
        }
    })?;

    if handler.verify_signature(&headers, &raw_body) == Some(false) {
        return Err(SyncError::Unauthorized("invalid webhook signature".to_string()));
    }

    let mut parsed_body = if raw_body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice::<Value>(&raw_body)
                .map_err(|e| SyncError::BadRequest(format!("malformed webhook body: {}", e)))?,
        )
    };

    if let Some(body) = &parsed_body {
        match state.ctx.webhooks.intercept(&plugin, &path, body).await {
            InterceptOutcome::Veto => {
                info!("Webhook {}/{} vetoed by interceptor", plugin, path);
                return Ok((StatusCode::OK, Json(json!({ "skipped": true }))).into_response());
            }
            InterceptOutcome::Continue(Some(replacement)) => parsed_body = Some(replacement),
            InterceptOutcome::Continue(None) => {}
        }
    }

    let header_map: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    if let Some(relay) = &state.relay {
        let signature = header_map.get(SIGNATURE_HEADER).cloned();
        relay.relay(&plugin, &path, raw_body.clone(), signature);
    }

    state.ctx.hub.publish(ReplicationMessage::webhook_received(&WebhookNotice {
        plugin_name: plugin.clone(),
        path: path.clone(),
        body: parsed_body.clone().unwrap_or(Value::Null),
    }));

    state.queue.enqueue(QueuedWebhook {
        plugin_name: plugin.clone(),
        path: path.clone(),
        raw_body,
        parsed_body,
        headers: header_map,
        timestamp: Utc::now(),
    });
    debug!("Accepted webhook {}/{}", plugin, path);

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response())
}
