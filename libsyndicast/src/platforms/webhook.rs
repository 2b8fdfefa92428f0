//! Webhook relay platform
//!
//! Fallback for platforms without a native client: the normalized post is
//! handed to an external automation webhook which performs the actual
//! publish. The webhook may answer with the created post's id; when it
//! does not, a synthetic id derived from the job keeps the idempotency
//! bookkeeping intact.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::PublishError;
use crate::platforms::{PlatformPublisher, PublishRequest, PublishTarget};

const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RelayResponse {
    external_post_id: Option<String>,
}

pub struct WebhookPublisher {
    name: String,
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookPublisher {
    /// A relay registered under `name` (e.g. "rss", "manual").
    pub fn new(name: impl Into<String>, url: String, secret: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            http,
            url,
            secret,
        }
    }
}

#[async_trait]
impl PlatformPublisher for WebhookPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<String, PublishError> {
        let job = request.job;
        let payload = serde_json::json!({
            "postId": job.id,
            "platform": job.platform,
            "postType": job.post_type,
            "contentText": job.content_text,
            "mediaUrl": job.media_url,
            "target": request.target.to_string(),
            "accessToken": request.access_token.expose_secret(),
        });

        let mut outgoing = self.http.post(&self.url).json(&payload);
        if let Some(secret) = &self.secret {
            outgoing = outgoing.header("x-webhook-secret", secret.as_str());
        }

        let response = outgoing.send().await.map_err(|e| {
            if e.is_timeout() {
                PublishError::Network("relay webhook timed out".to_string())
            } else {
                PublishError::Network(format!("relay webhook failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Api {
                status: status.as_u16(),
                message: format!("relay webhook returned {}", status),
            });
        }

        let body: RelayResponse = response.json().await.unwrap_or(RelayResponse {
            external_post_id: None,
        });

        let external_id = body
            .external_post_id
            .unwrap_or_else(|| match &request.target {
                PublishTarget::Feed => format!("webhook:{}", job.id),
                PublishTarget::Group(group_id) => format!("webhook:{}:{}", job.id, group_id),
            });

        debug!(job_id = %job.id, external_id, "relay accepted post");
        Ok(external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScheduledJob;
    use secrecy::SecretString;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_request<'a>(job: &'a ScheduledJob, token: &'a SecretString) -> PublishRequest<'a> {
        PublishRequest {
            job,
            author_id: "",
            access_token: token,
            thumbnail_url: None,
            target: PublishTarget::Feed,
        }
    }

    #[tokio::test]
    async fn test_relay_returns_external_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/publish"))
            .and(header("x-webhook-secret", "shh"))
            .and(body_partial_json(serde_json::json!({
                "platform": "rss",
                "contentText": "From the feed",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "external_post_id": "remote-42"
            })))
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new(
            "rss",
            format!("{}/publish", server.uri()),
            Some("shh".to_string()),
        );
        let job = ScheduledJob::new("u", "a", "rss", "From the feed", 0);
        let token = SecretString::from("tok");
        let id = publisher.publish(&feed_request(&job, &token)).await.unwrap();
        assert_eq!(id, "remote-42");
    }

    #[tokio::test]
    async fn test_relay_synthesizes_id_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new("manual", server.uri(), None);
        let job = ScheduledJob::new("u", "a", "manual", "content", 0);
        let token = SecretString::from("tok");
        let id = publisher.publish(&feed_request(&job, &token)).await.unwrap();
        assert_eq!(id, format!("webhook:{}", job.id));
    }

    #[tokio::test]
    async fn test_relay_http_failure_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new("manual", server.uri(), None);
        let job = ScheduledJob::new("u", "a", "manual", "content", 0);
        let token = SecretString::from("tok");
        let result = publisher.publish(&feed_request(&job, &token)).await;

        match result {
            Err(error @ PublishError::Api { status: 503, .. }) => {
                assert!(error.is_transient());
            }
            other => panic!("expected transient Api error, got {:?}", other),
        }
    }
}
