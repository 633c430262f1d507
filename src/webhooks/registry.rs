use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::queue::QueuedWebhook;
use crate::error::{SyncError, SyncResult};
use crate::source::SourceActions;

type HmacSha256 = Hmac<Sha256>;

/// Path key of the per-plugin fallback handler
pub const DEFAULT_PATH: &str = "*";

/// Header carrying `sha256=<hex hmac of the raw body>`
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// What an incremental handler gets to work with
pub struct WebhookContext<'a> {
    pub webhook: &'a QueuedWebhook,
    pub actions: &'a SourceActions,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Apply one webhook incrementally
    async fn handle(&self, ctx: WebhookContext<'_>) -> SyncResult<()>;

    /// `None` when this handler does not require a signature
    fn verify_signature(&self, _headers: &HeaderMap, _raw_body: &[u8]) -> Option<bool> {
        None
    }
}

/// HMAC-SHA256 check of the raw request body
#[derive(Clone)]
pub struct HmacSignatureVerifier {
    secret: Vec<u8>,
}

impl HmacSignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Header value a sender would attach for `body`
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(provided) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let hex_sig = provided.strip_prefix("sha256=").unwrap_or(provided);
        let Ok(expected) = hex::decode(hex_sig.trim()) else {
            return false;
        };

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }
}

/// Fallback handler registered for every plugin.
///
/// Items shaped `{"id": .., "deleted": true}` delete the matching node;
/// anything else needs a plugin-specific handler or the `Sync` strategy.
#[derive(Clone, Default)]
pub struct DefaultWebhookHandler {
    verifier: Option<HmacSignatureVerifier>,
}

impl DefaultWebhookHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed(secret: impl AsRef<[u8]>) -> Self {
        Self {
            verifier: Some(HmacSignatureVerifier::new(secret)),
        }
    }
}

#[async_trait]
impl WebhookHandler for DefaultWebhookHandler {
    async fn handle(&self, ctx: WebhookContext<'_>) -> SyncResult<()> {
        let Some(body) = ctx.webhook.parsed_body.as_ref() else {
            debug!("Webhook {} has no JSON body, nothing to apply", ctx.webhook.path);
            return Ok(());
        };

        let deleted = body.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        let source_id = match body.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        match (deleted, source_id) {
            (true, Some(source_id)) => {
                if ctx.actions.delete_by_source_id(&source_id).is_none() {
                    debug!("No node found for deleted source id {}", source_id);
                }
            }
            _ => debug!(
                "No incremental handler for {}/{}",
                ctx.webhook.plugin_name, ctx.webhook.path
            ),
        }
        Ok(())
    }

    fn verify_signature(&self, headers: &HeaderMap, raw_body: &[u8]) -> Option<bool> {
        self.verifier.as_ref().map(|v| v.verify(headers, raw_body))
    }
}

/// Outcome of the global interception hook
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptOutcome {
    /// Keep going, optionally with a replacement body
    Continue(Option<Value>),
    /// Drop the webhook
    Veto,
}

#[async_trait]
pub trait WebhookInterceptor: Send + Sync {
    async fn intercept(&self, plugin: &str, path: &str, body: &Value) -> SyncResult<InterceptOutcome>;
}

/// (plugin, path) -> handler
#[derive(Default)]
pub struct WebhookRegistry {
    handlers: RwLock<HashMap<(String, String), Arc<dyn WebhookHandler>>>,
    interceptor: RwLock<Option<Arc<dyn WebhookInterceptor>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration for the same key is an error.
    pub fn register(
        &self,
        plugin: &str,
        path: &str,
        handler: Arc<dyn WebhookHandler>,
    ) -> SyncResult<()> {
        let key = (plugin.to_string(), path.to_string());
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            return Err(SyncError::DuplicateWebhook {
                plugin: plugin.to_string(),
                path: path.to_string(),
            });
        }
        handlers.insert(key, handler);
        Ok(())
    }

    /// Install the fallback handler for `plugin` unless it already has one
    pub fn ensure_default(&self, plugin: &str, handler: Arc<dyn WebhookHandler>) -> bool {
        let key = (plugin.to_string(), DEFAULT_PATH.to_string());
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            return false;
        }
        handlers.insert(key, handler);
        true
    }

    /// Exact match first, then the plugin's fallback
    pub fn lookup(&self, plugin: &str, path: &str) -> Option<Arc<dyn WebhookHandler>> {
        let handlers = self.handlers.read();
        handlers
            .get(&(plugin.to_string(), path.to_string()))
            .or_else(|| handlers.get(&(plugin.to_string(), DEFAULT_PATH.to_string())))
            .cloned()
    }

    pub fn has_plugin(&self, plugin: &str) -> bool {
        self.handlers.read().keys().any(|(p, _)| p == plugin)
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn WebhookInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// Run the interception hook. Hook errors are logged and the payload
    /// passes through unchanged.
    pub async fn intercept(&self, plugin: &str, path: &str, body: &Value) -> InterceptOutcome {
        let interceptor = self.interceptor.read().clone();
        let Some(interceptor) = interceptor else {
            return InterceptOutcome::Continue(None);
        };

        match interceptor.intercept(plugin, path, body).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Webhook interceptor failed for {}/{}: {}", plugin, path, e);
                InterceptOutcome::Continue(None)
            }
        }
    }
}
