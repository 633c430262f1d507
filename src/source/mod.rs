//! Source plugins
//!
//! A source plugin owns a set of nodes and knows how to (re)produce them.
//! Sourcing runs on startup and whenever a webhook batch arrives for a
//! plugin using the `Sync` strategy.

pub mod actions;
pub mod json_file;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub use actions::SourceActions;
pub use json_file::{JsonFileSource, SOURCE_ID_FIELD};

use crate::context::{SyncContext, SyncNotice};
use crate::error::{SyncError, SyncResult};

/// How webhook batches for a plugin are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Re-run the full sourcing function
    #[default]
    Sync,
    /// Hand each item to the plugin's webhook handler
    Incremental,
}

#[async_trait]
pub trait SourcePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn strategy(&self) -> SyncStrategy {
        SyncStrategy::Sync
    }

    /// Node types this plugin produces
    fn node_types(&self) -> Vec<String>;

    async fn source_nodes(&self, actions: &SourceActions, options: &Value) -> SyncResult<()>;
}

/// A registered plugin and the options it is sourced with
#[derive(Clone)]
pub struct RegisteredPlugin {
    pub plugin: Arc<dyn SourcePlugin>,
    pub options: Value,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn SourcePlugin>, options: Value) {
        let name = plugin.name().to_string();
        if self
            .plugins
            .write()
            .insert(name.clone(), RegisteredPlugin { plugin, options })
            .is_some()
        {
            warn!("Source plugin {} was registered twice, keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<RegisteredPlugin> {
        self.plugins.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

/// Outcome of one full sourcing run
#[derive(Debug, Clone, Default)]
pub struct SourceReport {
    pub plugin: String,
    /// Nodes created or confirmed by the run
    pub nodes: usize,
    /// Stale nodes removed afterwards
    pub removed: usize,
    pub touched_owners: Vec<String>,
}

/// Run a plugin's full sourcing function. Stale nodes are removed only when
/// the run succeeds; a failed run leaves whatever it managed to write.
pub async fn run_source(ctx: &SyncContext, name: &str) -> SyncResult<SourceReport> {
    let registered = ctx
        .plugins
        .get(name)
        .ok_or_else(|| SyncError::NotFound(format!("source plugin {}", name)))?;

    let actions = SourceActions::new(ctx.clone(), name, registered.plugin.node_types());
    registered
        .plugin
        .source_nodes(&actions, &registered.options)
        .await
        .map_err(|e| match e {
            SyncError::Plugin { .. } => e,
            other => SyncError::plugin(name, other),
        })?;

    let removed = actions.remove_stale();
    let mut touched_owners: Vec<String> = actions.touched_owners().into_iter().collect();
    touched_owners.sort();

    let report = SourceReport {
        plugin: name.to_string(),
        nodes: actions.seen_count(),
        removed,
        touched_owners,
    };
    info!(
        "Sourced {} nodes from {} ({} stale removed)",
        report.nodes, name, report.removed
    );
    ctx.notify(SyncNotice::SourceCompleted {
        plugin: name.to_string(),
        nodes: report.nodes,
        removed: report.removed,
    });
    Ok(report)
}

/// Source every registered plugin, saving caches for the owners that changed.
/// A failing plugin is logged and skipped.
pub async fn source_all(ctx: &SyncContext) -> usize {
    let mut sourced = 0;
    for name in ctx.plugins.names() {
        match run_source(ctx, &name).await {
            Ok(report) => {
                sourced += 1;
                let owners = report.touched_owners.into_iter().collect();
                if let Err(e) = ctx.cache.save_affected_plugins(&owners).await {
                    warn!("Failed to save caches after sourcing {}: {}", name, e);
                }
            }
            Err(e) => warn!("Sourcing {} failed: {}", name, e),
        }
    }
    if let Err(e) = ctx.persist_deletions().await {
        warn!("Failed to persist deletion log: {}", e);
    }
    sourced
}
