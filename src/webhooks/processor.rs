use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::queue::WebhookBatch;
use super::registry::WebhookContext;
use crate::context::{SyncContext, SyncNotice};
use crate::error::{SyncError, SyncResult};
use crate::source::{run_source, SourceActions, SyncStrategy};

/// Result of reconciling one batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub plugin: String,
    pub items: usize,
    pub failed: usize,
    pub affected_owners: Vec<String>,
}

/// Reconcile one batch against the store, then persist the affected caches
pub async fn process_batch(ctx: &SyncContext, batch: WebhookBatch) -> SyncResult<BatchReport> {
    let plugin_name = batch.plugin_name.clone();
    let registered = ctx
        .plugins
        .get(&plugin_name)
        .ok_or_else(|| SyncError::NotFound(format!("source plugin {}", plugin_name)))?;

    let mut failed = 0;
    let owners: HashSet<String> = match registered.plugin.strategy() {
        SyncStrategy::Sync => match run_source(ctx, &plugin_name).await {
            Ok(report) => report.touched_owners.into_iter().collect(),
            Err(e) => {
                // Partial writes stay; the next trigger re-sources idempotently
                warn!("Re-sourcing {} failed: {}", plugin_name, e);
                failed = batch.items.len();
                HashSet::from([plugin_name.clone()])
            }
        },
        SyncStrategy::Incremental => {
            let actions =
                SourceActions::new(ctx.clone(), &plugin_name, registered.plugin.node_types());
            for item in &batch.items {
                let Some(handler) = ctx.webhooks.lookup(&plugin_name, &item.path) else {
                    warn!("No webhook handler for {}/{}", plugin_name, item.path);
                    failed += 1;
                    continue;
                };
                let hook_ctx = WebhookContext {
                    webhook: item,
                    actions: &actions,
                };
                if let Err(e) = handler.handle(hook_ctx).await {
                    warn!("Webhook handler {}/{} failed: {}", plugin_name, item.path, e);
                    failed += 1;
                }
            }
            actions.touched_owners()
        }
    };

    if let Err(e) = ctx.cache.save_affected_plugins(&owners).await {
        error!("Failed to save caches after batch for {}: {}", plugin_name, e);
    }
    if let Err(e) = ctx.persist_deletions().await {
        error!("Failed to persist deletion log: {}", e);
    }

    let mut affected_owners: Vec<String> = owners.into_iter().collect();
    affected_owners.sort();

    info!(
        "Processed {} webhooks for {} ({} failed)",
        batch.items.len(),
        plugin_name,
        failed
    );
    ctx.notify(SyncNotice::BatchProcessed {
        plugin: plugin_name.clone(),
        items: batch.items.len(),
        affected_owners: affected_owners.clone(),
    });

    Ok(BatchReport {
        plugin: plugin_name,
        items: batch.items.len(),
        failed,
        affected_owners,
    })
}

/// Consume batches until the queue is dropped
pub fn spawn_processor(
    ctx: SyncContext,
    mut batches: mpsc::UnboundedReceiver<WebhookBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let plugin = batch.plugin_name.clone();
            if let Err(e) = process_batch(&ctx, batch).await {
                warn!("Dropping webhook batch for {}: {}", plugin, e);
            }
        }
        info!("Webhook processor stopped");
    })
}
