// =============================================================================
// Notification sink
// =============================================================================
//
// Position lifecycle messages (created / closed) go to whatever sink is
// configured. The default sink just logs; the Discord sink posts to a
// webhook.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

/// Receives human-readable pipeline notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Default notifier: structured log output only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!(target: "notify", "{message}");
    }
}

/// Posts notifications to a Discord webhook. Delivery failures are logged
/// and never propagate into the pipeline.
pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            webhook_url: webhook_url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, message: &str) {
        let body = json!({ "content": message });
        match self.client.post(&self.webhook_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = %resp.status(), "discord webhook rejected notification");
            }
            Err(err) => {
                warn!(error = %err, "discord webhook delivery failed");
            }
        }
    }
}
