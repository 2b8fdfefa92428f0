//! Preview image resolution for link and video posts
//!
//! Rich link cards need a thumbnail. Preference order: whatever the job
//! already carries, then a predictable video-host thumbnail URL, then the
//! target page's `og:image` metadata (bounded fetch). Every step degrades
//! gracefully; a missing preview turns the job into a plain link post,
//! never a failure.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::types::ScheduledJob;

const HEAD_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);
/// Never read more than this much of a scraped page.
const MAX_SCRAPE_BYTES: usize = 1024 * 1024;

const SCRAPE_USER_AGENT: &str = "Mozilla/5.0 (compatible; SyndicastBot/1.0)";

fn video_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:youtu\.be/|youtube\.com/(?:watch\?v=|embed/|v/|shorts/))([A-Za-z0-9_-]{11})")
            .expect("video id pattern is valid")
    })
}

fn og_image_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta[^>]*property=["']og:image["'][^>]*content=["']([^"']+)["']"#)
            .expect("og:image pattern is valid")
    })
}

/// Whether a URL points at a known video host.
pub fn is_video_url(url: &str) -> bool {
    extract_video_id(url).is_some()
}

/// Extract the 11-character video id from a video-host URL.
pub fn extract_video_id(url: &str) -> Option<String> {
    video_id_regex()
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn max_res_thumbnail(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{}/maxresdefault.jpg", video_id)
}

fn fallback_thumbnail(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", video_id)
}

/// Resolve a preview image URL for the job, if one can be found.
pub async fn resolve_thumbnail(client: &reqwest::Client, job: &ScheduledJob) -> Option<String> {
    if let Some(thumbnail) = &job.thumbnail_url {
        return Some(thumbnail.clone());
    }

    let target = job.media_url.as_deref()?;

    if let Some(video_id) = extract_video_id(target) {
        return Some(resolve_video_thumbnail(client, &video_id).await);
    }

    scrape_og_image(client, target).await
}

/// Prefer the high-resolution thumbnail when the host has rendered one.
async fn resolve_video_thumbnail(client: &reqwest::Client, video_id: &str) -> String {
    let max_res = max_res_thumbnail(video_id);
    let head = client
        .head(&max_res)
        .timeout(HEAD_CHECK_TIMEOUT)
        .send()
        .await;

    match head {
        Ok(response) if response.status().is_success() => max_res,
        _ => fallback_thumbnail(video_id),
    }
}

/// Fetch the page and pull its `og:image`, within bounded time and size.
async fn scrape_og_image(client: &reqwest::Client, url: &str) -> Option<String> {
    let response = client
        .get(url)
        .timeout(SCRAPE_TIMEOUT)
        .header("User-Agent", SCRAPE_USER_AGENT)
        .send()
        .await
        .ok()?;

    if !response.status().is_success() {
        debug!(url, status = %response.status(), "preview scrape skipped");
        return None;
    }

    if let Some(length) = response.content_length() {
        if length as usize > MAX_SCRAPE_BYTES {
            debug!(url, length, "page too large for preview scrape");
            return None;
        }
    }

    let bytes = response.bytes().await.ok()?;
    let slice = &bytes[..bytes.len().min(MAX_SCRAPE_BYTES)];
    let html = String::from_utf8_lossy(slice);

    og_image_regex()
        .captures(&html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
