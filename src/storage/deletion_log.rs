//! Deletion log (tombstones) for removed nodes
//!
//! Followers use the log to learn about deletions through `/_sync`. Entries
//! expire after a retention period; expiry runs on load and on explicit or
//! scheduled cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::entity::Entity;

/// Configuration for tombstone retention
#[derive(Clone, Debug)]
pub struct DeletionLogConfig {
    /// How long to keep tombstones before eviction (default: 30 days)
    pub retention_period: Duration,
    /// How often the background task runs cleanup (default: 24 hours)
    pub cleanup_interval: Duration,
}

impl Default for DeletionLogConfig {
    fn default() -> Self {
        Self {
            retention_period: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            cleanup_interval: Duration::from_secs(24 * 60 * 60),      // 24 hours
        }
    }
}

impl DeletionLogConfig {
    pub fn with_retention_days(days: u64) -> Self {
        Self {
            retention_period: Duration::from_secs(days * 24 * 60 * 60),
            ..Default::default()
        }
    }
}

/// Tombstone for a deleted node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionEntry {
    pub node_id: String,
    pub node_type: String,
    pub owner: String,
    pub deleted_at: DateTime<Utc>,
}

/// Serialized form of the log
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionLogSnapshot {
    pub entries: Vec<DeletionEntry>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Append-only tombstone ledger with TTL eviction
#[derive(Debug)]
pub struct DeletionLog {
    config: DeletionLogConfig,
    entries: Vec<DeletionEntry>,
    last_cleanup: Option<DateTime<Utc>>,
}

pub type SharedDeletionLog = Arc<RwLock<DeletionLog>>;

impl Default for DeletionLog {
    fn default() -> Self {
        Self::new(DeletionLogConfig::default())
    }
}

impl DeletionLog {
    pub fn new(config: DeletionLogConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            last_cleanup: None,
        }
    }

    pub fn record_deletion(&mut self, entity: &Entity) {
        self.record_deletion_at(entity, Utc::now());
    }

    pub fn record_deletion_at(&mut self, entity: &Entity, now: DateTime<Utc>) {
        debug!("Recording tombstone for {} ({})", entity.id, entity.node_type);
        self.entries.push(DeletionEntry {
            node_id: entity.id.clone(),
            node_type: entity.node_type.clone(),
            owner: entity.owner.clone(),
            deleted_at: now,
        });
    }

    /// Merge tombstones received from another instance, skipping ones already held
    pub fn import(&mut self, entries: impl IntoIterator<Item = DeletionEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            let known = self
                .entries
                .iter()
                .any(|e| e.node_id == entry.node_id && e.deleted_at == entry.deleted_at);
            if !known {
                self.entries.push(entry);
                added += 1;
            }
        }
        added
    }

    /// Entries deleted strictly after `since`
    pub fn get_deleted_since(&self, since: DateTime<Utc>) -> Vec<DeletionEntry> {
        self.entries
            .iter()
            .filter(|e| e.deleted_at > since)
            .cloned()
            .collect()
    }

    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Utc::now())
    }

    /// Evict entries older than the retention period. Returns how many were removed.
    pub fn cleanup_at(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.retention_period)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.entries.len();
        self.entries.retain(|e| e.deleted_at >= cutoff);
        self.last_cleanup = Some(now);

        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Evicted {} expired tombstones", removed);
        }
        removed
    }

    pub fn to_json(&self) -> DeletionLogSnapshot {
        DeletionLogSnapshot {
            entries: self.entries.clone(),
            last_cleanup: self.last_cleanup,
        }
    }

    pub fn from_json(config: DeletionLogConfig, snapshot: DeletionLogSnapshot) -> Self {
        Self::from_json_at(config, snapshot, Utc::now())
    }

    /// Rebuild a log from its snapshot, running TTL cleanup against `now`
    pub fn from_json_at(
        config: DeletionLogConfig,
        snapshot: DeletionLogSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let mut log = Self {
            config,
            entries: snapshot.entries,
            last_cleanup: snapshot.last_cleanup,
        };
        log.cleanup_at(now);
        log
    }

    pub fn entries(&self) -> &[DeletionEntry] {
        &self.entries
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        self.last_cleanup
    }

    pub fn config(&self) -> &DeletionLogConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_cleanup = None;
    }

    pub fn stats(&self) -> DeletionLogStats {
        DeletionLogStats {
            total_entries: self.entries.len(),
            oldest: self.entries.iter().map(|e| e.deleted_at).min(),
            newest: self.entries.iter().map(|e| e.deleted_at).max(),
            retention_period_days: self.config.retention_period.as_secs() / (24 * 60 * 60),
        }
    }
}

/// Statistics about tombstones
#[derive(Debug, Clone)]
pub struct DeletionLogStats {
    pub total_entries: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub retention_period_days: u64,
}

impl std::fmt::Display for DeletionLogStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tombstones: {} (retention: {} days)",
            self.total_entries, self.retention_period_days
        )
    }
}

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Run cleanup on the configured interval for as long as the process lives.
/// `on_cleanup` is invoked after each pass, e.g. to persist the log.
pub fn spawn_cleanup_task<F>(log: SharedDeletionLog, on_cleanup: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() + Send + 'static,
{
    // tokio intervals must be non-zero
    let interval = log.read().config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; startup already cleaned on load
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = log.write().cleanup();
            if removed > 0 {
                info!("Cleaned up {} tombstones", removed);
            }
            on_cleanup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_stats() {
        let mut log = DeletionLog::default();
        let entity = Entity::new("n1", "Post", "cms", Map::new());
        log.record_deletion(&entity);
        log.record_deletion(&entity);

        let stats = log.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.retention_period_days, 30);
        assert!(stats.oldest <= stats.newest);
        assert_eq!(stats.to_string(), "Tombstones: 2 (retention: 30 days)");
    }
}
