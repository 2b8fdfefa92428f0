//! Core types for Syndicast

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a scheduled job.
///
/// Legal transitions: pending -> processing -> {published | partial |
/// pending | failed}. Stale recovery also moves processing -> pending.
/// `cancelled` is reachable only from pending and, like `failed`, is
/// terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Published,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Published => "published",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => JobStatus::Processing,
            "published" => JobStatus::Published,
            "partial" => JobStatus::Partial,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }

    /// Terminal states are never re-claimed or mutated by the worker.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Published | JobStatus::Partial | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a job publishes to: the account's own feed, or one or more groups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetType {
    Feed,
    Group,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Feed => "feed",
            TargetType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => TargetType::Group,
            _ => TargetType::Feed,
        }
    }
}

/// A unit of scheduled publishing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub platform: String,
    pub post_type: String,
    pub content_text: String,
    pub title: Option<String>,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub target_type: TargetType,
    /// Group ids for `TargetType::Group`, stored as a JSON array.
    pub target_ids: Vec<String>,
    pub scheduled_at: i64,
    pub timezone: Option<String>,
    pub status: JobStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    /// External post ids recorded after a successful (or partial) publish.
    pub external_post_ids: Vec<String>,
    /// Optional link back to the upstream content record.
    pub content_id: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScheduledJob {
    /// Create a feed post job due at `scheduled_at`.
    pub fn new(
        user_id: impl Into<String>,
        account_id: impl Into<String>,
        platform: impl Into<String>,
        content_text: impl Into<String>,
        scheduled_at: i64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            account_id: account_id.into(),
            platform: platform.into(),
            post_type: "text".to_string(),
            content_text: content_text.into(),
            title: None,
            media_url: None,
            thumbnail_url: None,
            target_type: TargetType::Feed,
            target_ids: Vec::new(),
            scheduled_at,
            timezone: None,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            external_post_ids: Vec::new(),
            content_id: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job looks like a video share (explicit type or video URL).
    pub fn is_video(&self) -> bool {
        self.post_type == "video"
            || self
                .media_url
                .as_deref()
                .map(crate::media::is_video_url)
                .unwrap_or(false)
    }
}

/// Connection state of a stored credential pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "revoked" => AccountStatus::Revoked,
            _ => AccountStatus::Active,
        }
    }
}

/// A connected social account with its encrypted OAuth credentials.
///
/// At most one row exists per (user, platform); token fields hold
/// age-encrypted, base64-encoded ciphertext and never plaintext.
#[derive(Debug, Clone)]
pub struct SocialAccount {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    /// Cached platform-side author identifier, resolved on first publish.
    pub platform_account_id: Option<String>,
    pub encrypted_access_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub status: AccountStatus,
    pub last_verified_at: Option<i64>,
    pub metadata: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outcome of publishing one job across all of its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    Published,
    Partial,
    Failed,
}

/// Per-job publish result: one external id per succeeded target, one
/// error message per failed target.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub status: PublishStatus,
    pub external_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl PublishReport {
    /// Derive the overall status from per-target results.
    pub fn from_results(external_ids: Vec<String>, errors: Vec<String>) -> Self {
        let status = if errors.is_empty() && !external_ids.is_empty() {
            PublishStatus::Published
        } else if !external_ids.is_empty() {
            PublishStatus::Partial
        } else {
            PublishStatus::Failed
        };
        Self {
            status,
            external_ids,
            errors,
        }
    }
}

/// Aggregate counters for one scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleLog {
    pub started_at: i64,
    pub finished_at: i64,
    pub processed: i64,
    pub published: i64,
    pub failed: i64,
    pub execution_time_ms: i64,
    pub errors_count: i64,
}
