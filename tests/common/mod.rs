//! Common test utilities
//!
//! Provides shared helpers for:
//! - Building isolated sync contexts
//! - Creating entities from JSON literals
//! - Driving the router and reading JSON responses

#![allow(dead_code)]

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use contentsync::server::{create_router, AppState};
use contentsync::storage::{DeletionLogConfig, Entity};
use contentsync::webhooks::{WebhookBatch, WebhookQueue};
use contentsync::SyncContext;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn create_test_context() -> (SyncContext, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let ctx = SyncContext::new(tmp_dir.path(), DeletionLogConfig::default());
    (ctx, tmp_dir)
}

pub fn entity(id: &str, node_type: &str, owner: &str, fields: Value) -> Entity {
    let fields = fields.as_object().cloned().unwrap_or_default();
    Entity::new(id, node_type, owner, fields)
}

pub fn create_test_app(
    ctx: &SyncContext,
    debounce: Duration,
) -> (axum::Router, Arc<WebhookQueue>, UnboundedReceiver<WebhookBatch>) {
    let (queue, batches) = WebhookQueue::new(debounce);
    let router = create_router(AppState::new(ctx.clone(), queue.clone()));
    (router, queue, batches)
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body)
        .unwrap_or(json!({"raw": String::from_utf8_lossy(&body).to_string()}))
}

/// Serve the router on an ephemeral loopback port
pub async fn spawn_server(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Router served from its own runtime on a dedicated thread. Stopping it
/// drops every open connection, websockets included, so followers see the
/// origin go away.
pub struct IsolatedServer {
    pub addr: SocketAddr,
    shutdown: tokio::sync::oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl IsolatedServer {
    /// Bind `addr` (port 0 for an ephemeral one) and start serving
    pub fn start(router: axum::Router, addr: SocketAddr) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build server runtime");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                tokio::select! {
                    _ = axum::serve(listener, router).into_future() => {}
                    _ = shutdown_rx => {}
                }
            });
        });
        let addr = addr_rx.recv().expect("server thread failed to bind");
        Self {
            addr,
            shutdown,
            thread,
        }
    }

    pub fn stop(self) {
        let _ = self.shutdown.send(());
        self.thread.join().expect("server thread panicked");
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
