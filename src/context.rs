//! Process-wide synchronization state
//!
//! One `SyncContext` is built at startup and cloned into every dependent.
//! Tests build their own to stay isolated.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::CacheManager;
use crate::error::SyncResult;
use crate::references::{Normalizer, ReferenceRegistry};
use crate::replication::ReplicationHub;
use crate::source::PluginRegistry;
use crate::storage::{
    DeletionLog, DeletionLogConfig, Entity, EntityStore, SharedDeletionLog, SharedStore,
};
use crate::webhooks::WebhookRegistry;

const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notices for observers (tests, logging, the binary)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncNotice {
    #[serde(rename_all = "camelCase")]
    BatchProcessed {
        plugin: String,
        items: usize,
        affected_owners: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    SourceCompleted {
        plugin: String,
        nodes: usize,
        removed: usize,
    },
    #[serde(rename_all = "camelCase")]
    RemoteSeeded { nodes: usize, deletions: usize },
}

#[derive(Clone)]
pub struct SyncContext {
    pub store: SharedStore,
    pub deletions: SharedDeletionLog,
    pub references: Arc<RwLock<ReferenceRegistry>>,
    pub normalizer: Arc<RwLock<Normalizer>>,
    pub cache: Arc<CacheManager>,
    pub plugins: Arc<PluginRegistry>,
    pub webhooks: Arc<WebhookRegistry>,
    pub hub: ReplicationHub,
    pub notices: broadcast::Sender<SyncNotice>,
}

impl SyncContext {
    pub fn new(cache_dir: impl Into<PathBuf>, deletion_config: DeletionLogConfig) -> Self {
        let store = EntityStore::shared();
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            cache: Arc::new(CacheManager::new(cache_dir, store.clone())),
            store,
            deletions: Arc::new(RwLock::new(DeletionLog::new(deletion_config))),
            references: Arc::new(RwLock::new(ReferenceRegistry::new())),
            normalizer: Arc::new(RwLock::new(Normalizer::new())),
            plugins: Arc::new(PluginRegistry::new()),
            webhooks: Arc::new(WebhookRegistry::new()),
            hub: ReplicationHub::new(),
            notices,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notify(&self, notice: SyncNotice) {
        debug!("Notice: {:?}", notice);
        let _ = self.notices.send(notice);
    }

    /// Remove a node and record its tombstone
    pub fn remove_node(&self, id: &str) -> Option<Entity> {
        let removed = self.store.write().remove(id)?;
        self.deletions.write().record_deletion(&removed);
        Some(removed)
    }

    pub async fn persist_deletions(&self) -> SyncResult<()> {
        let snapshot = self.deletions.read().to_json();
        self.cache.save_deletion_log(&snapshot).await
    }

    /// Reload the deletion log and every cached snapshot into this context.
    /// Returns how many entities were restored.
    pub async fn restore(&self) -> SyncResult<usize> {
        if let Some(snapshot) = self.cache.load_deletion_log().await? {
            let config = self.deletions.read().config().clone();
            *self.deletions.write() = DeletionLog::from_json(config, snapshot);
        }

        let mut restored = 0;
        for owner in self.cache.cached_owners().await? {
            restored += self.cache.load_plugin_cache(&owner).await?;
        }
        info!(
            "Restored {} cached nodes and {} tombstones",
            restored,
            self.deletions.read().len()
        );
        Ok(restored)
    }

    /// Drop all synchronized state. Registered plugins and webhook handlers stay.
    pub fn reset(&self) {
        self.store.write().clear();
        self.deletions.write().clear();
        self.references.write().clear();
        *self.normalizer.write() = Normalizer::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_remove_node_records_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SyncContext::new(dir.path(), DeletionLogConfig::default());
        ctx.store.write().set(Entity::new("n1", "Post", "cms", Map::new()));

        let removed = ctx.remove_node("n1").unwrap();
        assert_eq!(removed.owner, "cms");
        assert!(ctx.remove_node("n1").is_none());
        assert_eq!(ctx.deletions.read().len(), 1);
    }

    #[test]
    fn test_notice_shape() {
        let notice = SyncNotice::BatchProcessed {
            plugin: "shop".into(),
            items: 2,
            affected_owners: vec!["shop".into()],
        };
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["type"], "batchProcessed");
        assert_eq!(value["affectedOwners"][0], "shop");
    }
}
