//! Pull-based delta sync
//!
//! A follower asks for everything that changed after a timestamp and gets
//! back the updated entities plus the tombstones recorded since.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::storage::{DeletionEntry, DeletionLog, Entity, EntityStore};

/// Timestamp that seeds a follower from scratch
pub const EPOCH: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub updated: Vec<Entity>,
    pub deleted: Vec<DeletionEntry>,
    pub server_time: DateTime<Utc>,
    /// Reserved; pagination is not implemented so this is always false
    #[serde(default)]
    pub has_more: bool,
}

/// Parse the `since` parameter; a missing or malformed value is a bad request
pub fn parse_since(since: Option<&str>) -> SyncResult<DateTime<Utc>> {
    let raw = since
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::BadRequest("missing `since` parameter".to_string()))?;

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::BadRequest(format!("invalid `since` timestamp {:?}: {}", raw, e)))
}

/// Comma-separated type filter; empty means all types
pub fn parse_types(types: Option<&str>) -> Option<HashSet<String>> {
    let set: HashSet<String> = types?
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

/// Entities modified and tombstones recorded strictly after `since`
pub fn compute_delta(
    store: &EntityStore,
    log: &DeletionLog,
    since: DateTime<Utc>,
    types: Option<&HashSet<String>>,
    server_time: DateTime<Utc>,
) -> DeltaResponse {
    let wanted = |node_type: &str| types.map(|t| t.contains(node_type)).unwrap_or(true);

    let mut updated: Vec<Entity> = match types {
        Some(types) => types
            .iter()
            .flat_map(|t| store.get_by_type(t))
            .filter(|e| e.modified_at > since)
            .cloned()
            .collect(),
        None => store
            .get_all()
            .into_iter()
            .filter(|e| e.modified_at > since)
            .cloned()
            .collect(),
    };
    updated.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.id.cmp(&b.id)));

    let deleted = log
        .get_deleted_since(since)
        .into_iter()
        .filter(|d| wanted(&d.node_type))
        .collect();

    DeltaResponse {
        updated,
        deleted,
        server_time,
        has_more: false,
    }
}

/// RFC 3339 with a `Z` suffix, as sent in `since`
pub fn format_since(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
