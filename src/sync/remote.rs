//! Remote bootstrap: seed a follower from an origin, then go live

use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use super::delta::{DeltaResponse, EPOCH};
use crate::context::{SyncContext, SyncNotice};
use crate::error::{SyncError, SyncResult};
use crate::replication::{
    is_self_reference, origin_endpoint, ReplicationClient, ReplicationClientConfig,
    WebhookCallback,
};

/// Pull the origin's full state through `/_sync`
pub async fn fetch_remote_nodes(client: &reqwest::Client, remote: &Url) -> SyncResult<DeltaResponse> {
    let url = origin_endpoint(remote, "_sync")?;
    let response = client.get(url.clone()).query(&[("since", EPOCH)]).send().await?;

    if !response.status().is_success() {
        return Err(SyncError::Network(format!(
            "{} answered {}",
            url,
            response.status()
        )));
    }
    Ok(response.json::<DeltaResponse>().await?)
}

/// Replace local state with a full pull. The pull is authoritative: local
/// entities it does not contain are dropped and every cache is rewritten.
pub async fn apply_seed(ctx: &SyncContext, delta: DeltaResponse) -> SyncResult<usize> {
    let nodes = delta.updated.len();
    {
        let mut store = ctx.store.write();
        store.clear();
        for node in delta.updated {
            store.set(node);
        }
    }
    let deletions = ctx.deletions.write().import(delta.deleted);

    ctx.cache.replace_all_caches(None).await?;
    ctx.persist_deletions().await?;

    ctx.notify(SyncNotice::RemoteSeeded { nodes, deletions });
    Ok(nodes)
}

/// Where this instance listens, for the self-reference guard
#[derive(Debug, Clone)]
pub struct LocalAddress {
    pub host: String,
    pub port: u16,
}

pub enum RemoteSyncOutcome {
    /// The remote is this instance; source locally instead
    SelfReference,
    Seeded {
        nodes: usize,
        replication: JoinHandle<()>,
    },
}

/// Seed from the remote and upgrade to live replication. If the live
/// connection never comes up the seeded copy stays, just stale.
pub async fn init_remote_sync(
    ctx: &SyncContext,
    config: ReplicationClientConfig,
    local: &LocalAddress,
    on_webhook: Option<WebhookCallback>,
) -> SyncResult<RemoteSyncOutcome> {
    if is_self_reference(&config.remote, &local.host, local.port) {
        warn!(
            "Remote {} points at this instance, falling back to local sources",
            config.remote
        );
        return Ok(RemoteSyncOutcome::SelfReference);
    }

    info!("Seeding from {}", config.remote);
    let delta = fetch_remote_nodes(&reqwest::Client::new(), &config.remote).await?;
    let nodes = apply_seed(ctx, delta).await?;
    info!("Seeded {} nodes from {}", nodes, config.remote);

    let mut client = ReplicationClient::new(ctx.clone(), config);
    if let Some(callback) = on_webhook {
        client = client.with_webhook_callback(callback);
    }

    Ok(RemoteSyncOutcome::Seeded {
        nodes,
        replication: client.spawn(),
    })
}
