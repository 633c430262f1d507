use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::storage::Entity;

/// Bump when the snapshot layout changes; older files are then ignored.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable per-source snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub nodes: Vec<Entity>,
    /// type -> indexed fields
    #[serde(default)]
    pub indexes: BTreeMap<String, Vec<String>>,
    pub meta: CacheMeta,
}

/// Storage for one source's snapshot
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Load the snapshot. A missing, corrupt or outdated snapshot is `None`.
    async fn load(&self) -> SyncResult<Option<CachedSnapshot>>;

    async fn save(&self, snapshot: &CachedSnapshot) -> SyncResult<()>;

    async fn clear(&self) -> SyncResult<()>;
}

/// Versioned JSON file per source
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheBackend for JsonFileBackend {
    async fn load(&self) -> SyncResult<Option<CachedSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: CachedSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("Ignoring unreadable cache {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };

        if snapshot.meta.version != CACHE_VERSION {
            debug!(
                "Ignoring cache {} with version {} (expected {})",
                self.path.display(),
                snapshot.meta.version,
                CACHE_VERSION
            );
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &CachedSnapshot) -> SyncResult<()> {
        write_json_atomic(&self.path, snapshot).await
    }

    async fn clear(&self) -> SyncResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write JSON to a sibling temp file, then rename over the target
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let bytes = serde_json::to_vec(value)?;
    let tmp = path.with_extension("json.tmp");
    let write = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await
    };
    write
        .await
        .map_err(|e| SyncError::Cache(format!("cannot write {}: {}", path.display(), e)))
}
