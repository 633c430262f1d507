//! Debounced webhook queue
//!
//! Items are buffered per plugin. Each new item restarts that plugin's
//! quiescence timer; the batch is flushed once the timer runs out with no
//! further arrivals, or immediately on a forced flush.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default quiescence window
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct QueuedWebhook {
    pub plugin_name: String,
    pub path: String,
    pub raw_body: Bytes,
    pub parsed_body: Option<Value>,
    /// Lowercased header names
    pub headers: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl QueuedWebhook {
    pub fn new(plugin_name: impl Into<String>, path: impl Into<String>, raw_body: Bytes) -> Self {
        let parsed_body = serde_json::from_slice(&raw_body).ok();
        Self {
            plugin_name: plugin_name.into(),
            path: path.into(),
            raw_body,
            parsed_body,
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Items for one plugin, flushed together
#[derive(Debug, Clone)]
pub struct WebhookBatch {
    pub plugin_name: String,
    pub items: Vec<QueuedWebhook>,
}

#[derive(Default)]
struct Pending {
    items: Vec<QueuedWebhook>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct WebhookQueue {
    window: Duration,
    pending: Mutex<HashMap<String, Pending>>,
    batches: mpsc::UnboundedSender<WebhookBatch>,
}

impl WebhookQueue {
    /// Create a queue and the receiving end its batches are delivered to
    pub fn new(window: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<WebhookBatch>) {
        let (batches, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            window,
            pending: Mutex::new(HashMap::new()),
            batches,
        });
        (queue, rx)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Buffer an item and restart its plugin's timer
    pub fn enqueue(self: &Arc<Self>, item: QueuedWebhook) {
        let key = item.plugin_name.clone();
        let mut pending = self.pending.lock();
        let entry = pending.entry(key.clone()).or_default();
        entry.items.push(item);
        entry.generation += 1;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let generation = entry.generation;
        let count = entry.items.len();
        let queue = Arc::clone(self);
        let window = self.window;
        let timer_key = key.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            queue.flush_if_quiet(&timer_key, generation);
        }));
        debug!("Queued webhook for {} ({} pending)", key, count);
    }

    /// Items currently waiting for `key`
    pub fn pending_len(&self, key: &str) -> usize {
        self.pending.lock().get(key).map(|p| p.items.len()).unwrap_or(0)
    }

    /// Flush `key` now, bypassing its timer. Returns false when nothing was pending.
    pub fn flush(&self, key: &str) -> bool {
        let pending = self.pending.lock().remove(key);
        match pending {
            Some(mut p) => {
                if let Some(timer) = p.timer.take() {
                    timer.abort();
                }
                self.send(key, p.items)
            }
            None => false,
        }
    }

    /// Flush every pending key. Returns how many batches were sent.
    pub fn flush_all(&self) -> usize {
        let drained: Vec<(String, Pending)> = self.pending.lock().drain().collect();
        let mut sent = 0;
        for (key, mut p) in drained {
            if let Some(timer) = p.timer.take() {
                timer.abort();
            }
            if self.send(&key, p.items) {
                sent += 1;
            }
        }
        sent
    }

    fn flush_if_quiet(&self, key: &str, generation: u64) {
        let items = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(p) if p.generation == generation => {
                    pending.remove(key).map(|p| p.items).unwrap_or_default()
                }
                // A newer item restarted the window
                _ => return,
            }
        };
        self.send(key, items);
    }

    fn send(&self, key: &str, items: Vec<QueuedWebhook>) -> bool {
        if items.is_empty() {
            return false;
        }
        debug!("Flushing {} webhooks for {}", items.len(), key);
        let batch = WebhookBatch {
            plugin_name: key.to_string(),
            items,
        };
        if self.batches.send(batch).is_err() {
            warn!("Webhook processor is gone, dropping batch for {}", key);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forced_flush_bypasses_timer() {
        let (queue, mut rx) = WebhookQueue::new(Duration::from_secs(60));
        queue.enqueue(QueuedWebhook::new("shop", "orders", Bytes::from_static(b"{}")));
        assert_eq!(queue.pending_len("shop"), 1);

        assert!(queue.flush("shop"));
        assert!(!queue.flush("shop"));
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(queue.pending_len("shop"), 0);
    }
}
