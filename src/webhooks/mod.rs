//! Webhook ingestion, batching and reconciliation

pub mod processor;
pub mod queue;
pub mod registry;
pub mod relay;

pub use processor::{process_batch, spawn_processor, BatchReport};
pub use queue::{QueuedWebhook, WebhookBatch, WebhookQueue, DEFAULT_DEBOUNCE};
pub use registry::{
    DefaultWebhookHandler, HmacSignatureVerifier, InterceptOutcome, WebhookContext,
    WebhookHandler, WebhookInterceptor, WebhookRegistry, DEFAULT_PATH, SIGNATURE_HEADER,
};
pub use relay::WebhookRelay;
