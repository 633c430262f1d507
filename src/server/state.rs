use std::sync::Arc;

use crate::context::SyncContext;
use crate::webhooks::{WebhookQueue, WebhookRelay};

/// Default ceiling for inbound webhook bodies
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ctx: SyncContext,
    pub queue: Arc<WebhookQueue>,
    pub relay: Option<WebhookRelay>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(ctx: SyncContext, queue: Arc<WebhookQueue>) -> Self {
        Self {
            ctx,
            queue,
            relay: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_relay(mut self, relay: WebhookRelay) -> Self {
        if !relay.destinations().is_empty() {
            self.relay = Some(relay);
        }
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}
