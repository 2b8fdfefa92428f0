//! LinkedIn platform client
//!
//! Publishes UGC posts to the member's feed or to groups. Media-bearing
//! posts upload image assets first; video links go out as rich article
//! cards. The client converts LinkedIn's "duplicate of urn:..." rejection
//! into [`PublishError::Duplicate`] so callers never have to inspect
//! error text themselves.

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::media;
use crate::platforms::{PlatformPublisher, PublishRequest, PublishTarget};

const DEFAULT_API_BASE: &str = "https://api.linkedin.com";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
const ASSET_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// LinkedIn description hard limit.
const CHARACTER_LIMIT: usize = 3000;
/// Image assets above this size are rejected before upload.
const MAX_ASSET_BYTES: usize = 5 * 1024 * 1024;

const RESTLI_HEADER: (&str, &str) = ("X-Restli-Protocol-Version", "2.0.0");

type PublishResult<T> = std::result::Result<T, PublishError>;

fn duplicate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"duplicate of (urn:li:[A-Za-z0-9:]+)").expect("duplicate pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
}

#[derive(Debug, Deserialize)]
struct UgcPostResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

pub struct LinkedInPublisher {
    http: reqwest::Client,
    api_base: String,
}

impl LinkedInPublisher {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE.to_string())
    }

    /// Point the client at a different API host (used by tests).
    pub fn with_api_base(api_base: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, api_base }
    }

    /// Classify a non-success API response into a structured error.
    fn classify_error(status: reqwest::StatusCode, message: &str) -> PublishError {
        if let Some(caps) = duplicate_regex().captures(message) {
            return PublishError::Duplicate {
                existing_id: caps[1].to_string(),
            };
        }

        match status.as_u16() {
            401 | 403 => PublishError::Authentication(message.to_string()),
            429 => PublishError::RateLimited(message.to_string()),
            code => PublishError::Api {
                status: code,
                message: message.to_string(),
            },
        }
    }

    /// Download an image and register it as a native LinkedIn asset.
    ///
    /// Required for large-card image posts; article/video shares reference
    /// the URL directly and skip this.
    async fn upload_image_asset(
        &self,
        access_token: &SecretString,
        author_id: &str,
        image_url: &str,
    ) -> PublishResult<String> {
        debug!(image_url, "downloading image for asset upload");

        let image = self
            .http
            .get(image_url)
            .timeout(ASSET_DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| PublishError::Network(format!("image download failed: {}", e)))?;

        if !image.status().is_success() {
            return Err(PublishError::Network(format!(
                "image download returned {}",
                image.status()
            )));
        }

        let content_type = image
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        let bytes = image
            .bytes()
            .await
            .map_err(|e| PublishError::Network(format!("image download failed: {}", e)))?;

        if bytes.len() > MAX_ASSET_BYTES {
            return Err(PublishError::Validation(format!(
                "media asset exceeds {}MB limit ({:.2}MB)",
                MAX_ASSET_BYTES / (1024 * 1024),
                bytes.len() as f64 / 1024.0 / 1024.0
            )));
        }

        let register_payload = serde_json::json!({
            "registerUploadRequest": {
                "recipes": ["urn:li:digitalmediaRecipe:feedshare-image"],
                "owner": author_id,
                "serviceRelationships": [{
                    "relationshipType": "OWNER",
                    "identifier": "urn:li:userGeneratedContent"
                }]
            }
        });

        let register = self
            .http
            .post(format!("{}/v2/assets?action=registerUpload", self.api_base))
            .bearer_auth(access_token.expose_secret())
            .header(RESTLI_HEADER.0, RESTLI_HEADER.1)
            .json(&register_payload)
            .send()
            .await
            .map_err(|e| PublishError::Network(format!("asset registration failed: {}", e)))?;

        if !register.status().is_success() {
            return Err(PublishError::Api {
                status: register.status().as_u16(),
                message: "asset registration rejected".to_string(),
            });
        }

        let body: serde_json::Value = register
            .json()
            .await
            .map_err(|e| PublishError::Network(format!("asset registration failed: {}", e)))?;

        let upload_url = body["value"]["uploadMechanism"]
            ["com.linkedin.digitalmedia.uploading.MediaUploadHttpRequest"]["uploadUrl"]
            .as_str()
            .ok_or_else(|| {
                PublishError::Api {
                    status: 200,
                    message: "asset registration response missing uploadUrl".to_string(),
                }
            })?
            .to_string();
        let asset_urn = body["value"]["asset"]
            .as_str()
            .ok_or_else(|| PublishError::Api {
                status: 200,
                message: "asset registration response missing asset urn".to_string(),
            })?
            .to_string();

        let upload = self
            .http
            .put(&upload_url)
            .bearer_auth(access_token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| PublishError::Network(format!("asset upload failed: {}", e)))?;

        if !upload.status().is_success() {
            return Err(PublishError::Api {
                status: upload.status().as_u16(),
                message: "asset binary upload rejected".to_string(),
            });
        }

        info!(asset_urn, "image registered as native asset");
        Ok(asset_urn)
    }

    /// Assemble the UGC post payload for one target.
    async fn build_payload(
        &self,
        request: &PublishRequest<'_>,
    ) -> PublishResult<serde_json::Value> {
        let job = request.job;
        let is_video = job.is_video();
        let has_media = job.media_url.is_some();

        let (share_media_category, media) = if is_video {
            let media_entry = serde_json::json!({
                "status": "READY",
                "description": { "text": job.content_text },
                "originalUrl": job.media_url,
                "title": { "text": job.title.as_deref().unwrap_or("Shared Video") },
                "thumbnails": request
                    .thumbnail_url
                    .map(|url| vec![serde_json::json!({ "url": url })])
                    .unwrap_or_default(),
            });
            ("ARTICLE", vec![media_entry])
        } else if has_media {
            let asset_urn = self
                .upload_image_asset(
                    request.access_token,
                    request.author_id,
                    job.media_url.as_deref().unwrap_or_default(),
                )
                .await?;
            (
                "IMAGE",
                vec![serde_json::json!({ "status": "READY", "media": asset_urn })],
            )
        } else {
            ("NONE", vec![])
        };

        let visibility = match &request.target {
            PublishTarget::Feed => "PUBLIC",
            PublishTarget::Group(_) => "CONTAINER",
        };

        let mut payload = serde_json::json!({
            "author": request.author_id,
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": { "text": job.content_text },
                    "shareMediaCategory": share_media_category,
                }
            },
            "visibility": {
                "com.linkedin.ugc.MemberNetworkVisibility": visibility
            }
        });

        if share_media_category != "NONE" {
            payload["specificContent"]["com.linkedin.ugc.ShareContent"]["media"] =
                serde_json::json!(media);
        }

        if let PublishTarget::Group(group_id) = &request.target {
            payload["containerEntity"] = serde_json::json!(format!("urn:li:group:{}", group_id));
        }

        Ok(payload)
    }
}

impl Default for LinkedInPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformPublisher for LinkedInPublisher {
    fn name(&self) -> &str {
        "linkedin"
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CHARACTER_LIMIT)
    }

    fn is_valid_author_id(&self, author_id: &str) -> bool {
        author_id.starts_with("urn:li:")
    }

    async fn resolve_author(
        &self,
        access_token: &SecretString,
    ) -> PublishResult<Option<String>> {
        let response = self
            .http
            .get(format!("{}/v2/userinfo", self.api_base))
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(|e| PublishError::Network(format!("identity lookup failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PublishError::Authentication(format!(
                "identity lookup returned {}",
                response.status()
            )));
        }

        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| PublishError::Network(format!("identity lookup failed: {}", e)))?;

        let author_id = if info.sub.starts_with("urn:li:") {
            info.sub
        } else {
            format!("urn:li:person:{}", info.sub)
        };

        debug!(author_id, "resolved author identity");
        Ok(Some(author_id))
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> PublishResult<String> {
        let payload = self.build_payload(request).await?;

        debug!(
            author = request.author_id,
            target = %request.target,
            "creating UGC post"
        );

        let response = self
            .http
            .post(format!("{}/v2/ugcPosts", self.api_base))
            .bearer_auth(request.access_token.expose_secret())
            .header(RESTLI_HEADER.0, RESTLI_HEADER.1)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Network("publish request timed out".to_string())
                } else {
                    PublishError::Network(format!("publish request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            warn!(%status, "UGC post rejected: {}", message);
            return Err(Self::classify_error(status, &message));
        }

        let created: UgcPostResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Network(format!("malformed publish response: {}", e)))?;

        Ok(created.id)
    }
}

/// Predictable thumbnail for a video link, used when nothing better exists.
pub fn video_fallback_thumbnail(url: &str) -> Option<String> {
    media::extract_video_id(url)
        .map(|id| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", id))
}
