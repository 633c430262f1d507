use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::replication::ReplicationClientConfig;
use crate::storage::DeletionLogConfig;

/// Top-level configuration, loadable from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub webhooks: WebhookConfig,
    pub replication: ReplicationConfig,
    pub deletions: DeletionConfig,
    /// Source name -> JSON feed path
    pub sources: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.contentsync"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub debounce_ms: u64,
    pub max_body_bytes: usize,
    pub relay_destinations: Vec<String>,
    /// When set, default handlers require `x-webhook-signature`
    pub signing_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_body_bytes: 1024 * 1024,
            relay_destinations: Vec::new(),
            signing_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Origin to follow; unset means this instance is an origin
    pub remote_url: Option<String>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub keepalive_secs: u64,
    pub resync_on_reconnect: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: None,
            keepalive_secs: 30,
            resync_on_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    pub retention_days: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.webhooks.debounce_ms)
    }

    pub fn deletion_log(&self) -> DeletionLogConfig {
        DeletionLogConfig {
            retention_period: Duration::from_secs(self.deletions.retention_days * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(self.deletions.cleanup_interval_secs.max(1)),
        }
    }

    /// Client settings when a remote is configured
    pub fn replication_client(&self) -> SyncResult<Option<ReplicationClientConfig>> {
        let Some(remote) = self.replication.remote_url.as_deref() else {
            return Ok(None);
        };
        let mut config = ReplicationClientConfig::new(Url::parse(remote)?);
        config.reconnect_delay = Duration::from_millis(self.replication.reconnect_delay_ms);
        config.max_reconnect_attempts = self.replication.max_reconnect_attempts;
        config.keepalive = Duration::from_secs(self.replication.keepalive_secs.max(1));
        config.resync_on_reconnect = self.replication.resync_on_reconnect;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.webhooks.debounce_ms, 500);
        assert_eq!(config.webhooks.max_body_bytes, 1024 * 1024);
        assert_eq!(config.replication.reconnect_delay_ms, 5000);
        assert!(config.replication.max_reconnect_attempts.is_none());
        assert!(config.replication.resync_on_reconnect);
        assert_eq!(config.deletion_log().retention_period, Duration::from_secs(30 * 86400));
        assert!(config.replication_client().unwrap().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml(
            r#"
            [server]
            port = 5000

            [replication]
            remote_url = "http://origin:4000"
            max_reconnect_attempts = 3

            [sources]
            blog = "./feeds/blog.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sources["blog"], PathBuf::from("./feeds/blog.json"));

        let client = config.replication_client().unwrap().unwrap();
        assert_eq!(client.max_reconnect_attempts, Some(3));
        assert_eq!(client.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = SyncConfig::from_toml(
            r#"
            [deletions]
            cleanup_interval_secs = 0

            [replication]
            remote_url = "http://origin:4000"
            keepalive_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.deletion_log().cleanup_interval, Duration::from_secs(1));
        let client = config.replication_client().unwrap().unwrap();
        assert_eq!(client.keepalive, Duration::from_secs(1));
    }

    #[test]
    fn test_bad_remote_url() {
        let config = SyncConfig::from_toml("[replication]\nremote_url = \"not a url\"").unwrap();
        assert!(matches!(config.replication_client(), Err(SyncError::Config(_))));
    }
}
