//! Credential revocation notifications
//!
//! When a refresh fails terminally the owning user has to reconnect the
//! account out of band, so somebody must be told. Delivery goes through a
//! webhook; a failed delivery never blocks the revocation itself.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::error::Result;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the account owner that their platform connection was revoked.
    async fn credential_revoked(&self, user_id: &str, platform: &str, reason: &str) -> Result<()>;
}

/// POSTs revocation notices to a configured webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            secret,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn credential_revoked(&self, user_id: &str, platform: &str, reason: &str) -> Result<()> {
        let payload = serde_json::json!({
            "event": "credential_revoked",
            "user_id": user_id,
            "platform": platform,
            "reason": reason,
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(secret) = &self.secret {
            request = request.header("x-webhook-secret", secret.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(user_id, platform, "revocation notice delivered");
            }
            Ok(response) => {
                warn!(
                    user_id,
                    platform,
                    status = %response.status(),
                    "revocation notice rejected by webhook"
                );
            }
            Err(e) => {
                warn!(user_id, platform, "revocation notice delivery failed: {}", e);
            }
        }

        // Delivery problems are logged, not propagated
        Ok(())
    }
}

/// Used when no webhook is configured; the revocation is only logged.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn credential_revoked(&self, user_id: &str, platform: &str, reason: &str) -> Result<()> {
        warn!(
            user_id,
            platform, "credential revoked ({}); no notification webhook configured", reason
        );
        Ok(())
    }
}

/// Build the notifier described by the configuration.
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            config.webhook_secret.clone(),
        )),
        None => Arc::new(NoopNotifier),
    }
}
