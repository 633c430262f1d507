use std::time::Duration;

use axum::body::Bytes;
use tracing::{debug, warn};

use super::registry::SIGNATURE_HEADER;

/// Forwards received webhooks to other instances, fire-and-forget
#[derive(Clone)]
pub struct WebhookRelay {
    client: reqwest::Client,
    destinations: Vec<String>,
}

impl WebhookRelay {
    pub fn new(destinations: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            destinations,
        }
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// Target URL on a destination base
    pub fn target_url(destination: &str, plugin: &str, path: &str) -> String {
        format!(
            "{}/_webhooks/{}/{}",
            destination.trim_end_matches('/'),
            plugin,
            path
        )
    }

    /// Post the raw body to every destination without waiting for the results
    pub fn relay(&self, plugin: &str, path: &str, body: Bytes, signature: Option<String>) {
        for destination in &self.destinations {
            let url = Self::target_url(destination, plugin, path);
            let client = self.client.clone();
            let body = body.clone();
            let signature = signature.clone();

            tokio::spawn(async move {
                let mut request = client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
                if let Some(sig) = signature {
                    request = request.header(SIGNATURE_HEADER, sig);
                }

                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("Relayed webhook to {}", url);
                    }
                    Ok(resp) => warn!("Relay to {} answered {}", url, resp.status()),
                    Err(e) => warn!("Relay to {} failed: {}", url, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        assert_eq!(
            WebhookRelay::target_url("http://edge:4000/", "shop", "orders"),
            "http://edge:4000/_webhooks/shop/orders"
        );
    }
}
