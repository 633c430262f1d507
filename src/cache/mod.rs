//! Per-source durable snapshots
//!
//! The store is authoritative; snapshots only shorten cold starts. Every
//! failure to read a snapshot is treated as a cache miss.

pub mod backend;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub use backend::{CacheBackend, CacheMeta, CachedSnapshot, JsonFileBackend, CACHE_VERSION};

use crate::error::SyncResult;
use crate::storage::{DeletionLogSnapshot, Entity, EntityStore, SharedStore};

/// File holding the persisted deletion log, next to the snapshots
pub const DELETIONS_FILE: &str = "_deletions.json";

pub struct CacheManager {
    dir: PathBuf,
    store: RwLock<SharedStore>,
    backends: RwLock<HashMap<String, Arc<dyn CacheBackend>>>,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>, store: SharedStore) -> Self {
        Self {
            dir: dir.into(),
            store: RwLock::new(store),
            backends: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Point the manager at a different active store
    pub fn set_store(&self, store: SharedStore) {
        *self.store.write() = store;
    }

    pub fn store(&self) -> SharedStore {
        self.store.read().clone()
    }

    pub fn set_backend(&self, owner: &str, backend: Arc<dyn CacheBackend>) {
        self.backends.write().insert(owner.to_string(), backend);
    }

    /// The backend for `owner`, defaulting to a JSON file in the cache dir
    pub fn backend(&self, owner: &str) -> Arc<dyn CacheBackend> {
        if let Some(backend) = self.backends.read().get(owner) {
            return backend.clone();
        }
        Arc::new(JsonFileBackend::new(self.snapshot_path(&sanitize_owner(owner))))
    }

    fn snapshot_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stem))
    }

    /// Write the snapshot for one owner
    pub async fn save_plugin_cache(&self, owner: &str, store: Option<&SharedStore>) -> SyncResult<()> {
        let store = store.cloned().unwrap_or_else(|| self.store());
        let (nodes, indexes) = {
            let guard = store.read();
            owner_contents(&guard, owner)
        };
        self.write_snapshot(owner, nodes, indexes).await
    }

    /// Rewrite every snapshot from `store` in one pass. Owners that have no
    /// entities left get their snapshot cleared. Returns how many were written.
    pub async fn replace_all_caches(&self, store: Option<&SharedStore>) -> SyncResult<usize> {
        let store = store.cloned().unwrap_or_else(|| self.store());
        let grouped: BTreeMap<String, (Vec<Entity>, BTreeMap<String, Vec<String>>)> = {
            let guard = store.read();
            let owners: HashSet<String> = guard.get_all().iter().map(|e| e.owner.clone()).collect();
            owners
                .into_iter()
                .map(|owner| {
                    let contents = owner_contents(&guard, &owner);
                    (owner, contents)
                })
                .collect()
        };

        // Snapshot files are keyed by sanitized name, overrides by owner
        let mut stale_files: HashSet<String> = self.cached_owners().await?.into_iter().collect();
        let mut stale_overrides: HashSet<String> = self.backends.read().keys().cloned().collect();

        let written = grouped.len();
        for (owner, (nodes, indexes)) in grouped {
            stale_files.remove(&sanitize_owner(&owner));
            stale_overrides.remove(&owner);
            self.write_snapshot(&owner, nodes, indexes).await?;
        }

        for owner in stale_overrides {
            debug!("Clearing cache for owner {} with no entities", owner);
            self.backend(&owner).clear().await?;
        }
        for stem in stale_files {
            debug!("Clearing stale snapshot {}.json", stem);
            JsonFileBackend::new(self.snapshot_path(&stem)).clear().await?;
        }

        info!("Replaced caches for {} owners", written);
        Ok(written)
    }

    /// Save only the owners touched by one mutation batch. Every owner is
    /// attempted; the first error is returned.
    pub async fn save_affected_plugins(&self, owners: &HashSet<String>) -> SyncResult<()> {
        let mut first_err = None;
        for owner in owners {
            if let Err(e) = self.save_plugin_cache(owner, None).await {
                warn!("Failed to save cache for {}: {}", owner, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restore an owner's snapshot into the active store
    pub async fn load_plugin_cache(&self, owner: &str) -> SyncResult<usize> {
        let snapshot = match self.backend(owner).load().await? {
            Some(s) => s,
            None => return Ok(0),
        };

        let store = self.store();
        let mut guard = store.write();
        for (node_type, fields) in &snapshot.indexes {
            for field in fields {
                guard.register_index(node_type, field);
            }
        }
        let count = snapshot.nodes.len();
        for node in snapshot.nodes {
            guard.set(node);
        }
        debug!("Restored {} cached nodes for {}", count, owner);
        Ok(count)
    }

    pub async fn clear_plugin_cache(&self, owner: &str) -> SyncResult<()> {
        self.backend(owner).clear().await
    }

    /// Snapshot file names in the cache dir, without extension. These are
    /// owner names after sanitizing, so `@scope/cms` lists as `_scope_cms`.
    pub async fn cached_owners(&self) -> SyncResult<Vec<String>> {
        let mut owners = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(owners),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == DELETIONS_FILE {
                continue;
            }
            if let Some(owner) = name.strip_suffix(".json") {
                owners.push(owner.to_string());
            }
        }
        owners.sort();
        Ok(owners)
    }

    pub async fn save_deletion_log(&self, snapshot: &DeletionLogSnapshot) -> SyncResult<()> {
        backend::write_json_atomic(&self.dir.join(DELETIONS_FILE), snapshot).await
    }

    pub async fn load_deletion_log(&self) -> SyncResult<Option<DeletionLogSnapshot>> {
        let path = self.dir.join(DELETIONS_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Ignoring unreadable deletion log: {}", e);
                Ok(None)
            }
        }
    }

    async fn write_snapshot(
        &self,
        owner: &str,
        nodes: Vec<Entity>,
        indexes: BTreeMap<String, Vec<String>>,
    ) -> SyncResult<()> {
        let backend = self.backend(owner);
        let now = Utc::now();
        let created_at = backend
            .load()
            .await
            .ok()
            .flatten()
            .map(|s| s.meta.created_at)
            .unwrap_or(now);

        let snapshot = CachedSnapshot {
            nodes,
            indexes,
            meta: CacheMeta {
                version: CACHE_VERSION,
                created_at,
                updated_at: now,
            },
        };
        debug!("Saving {} nodes to cache for {}", snapshot.nodes.len(), owner);
        backend.save(&snapshot).await
    }
}

fn owner_contents(store: &EntityStore, owner: &str) -> (Vec<Entity>, BTreeMap<String, Vec<String>>) {
    let mut nodes: Vec<Entity> = store
        .get_all()
        .into_iter()
        .filter(|e| e.owner == owner)
        .cloned()
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut indexes = BTreeMap::new();
    for node in &nodes {
        if indexes.contains_key(&node.node_type) {
            continue;
        }
        let fields = store.indexed_fields(&node.node_type);
        if !fields.is_empty() {
            indexes.insert(node.node_type.clone(), fields);
        }
    }
    (nodes, indexes)
}

/// Keep owner names safe to use as file names
fn sanitize_owner(owner: &str) -> String {
    owner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_owner() {
        assert_eq!(sanitize_owner("shopify"), "shopify");
        assert_eq!(sanitize_owner("@scope/cms"), "_scope_cms");
        assert_eq!(sanitize_owner("../etc"), ".._etc");
    }
}
