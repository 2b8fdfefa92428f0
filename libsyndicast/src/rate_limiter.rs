//! Admission control for scheduled publishing
//!
//! Answers "may this user post to this platform right now?" from the
//! publish-history ledger: a per-platform daily ceiling plus a minimum
//! spacing between consecutive posts. Any internal error while checking
//! denies admission; an unverified rate is worse than a delayed post.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::warn;

use crate::config::PlatformLimits;
use crate::db::Database;

/// Ceilings applied to platforms with no configured limits.
const FALLBACK_LIMITS: PlatformLimits = PlatformLimits {
    daily_posts: 20,
    min_interval_minutes: 5,
};

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

pub struct AdmissionControl {
    limits: HashMap<String, PlatformLimits>,
}

impl AdmissionControl {
    pub fn new(limits: HashMap<String, PlatformLimits>) -> Self {
        Self { limits }
    }

    fn limits_for(&self, platform: &str) -> PlatformLimits {
        self.limits
            .get(&platform.to_lowercase())
            .copied()
            .unwrap_or(FALLBACK_LIMITS)
    }

    /// Check whether a publish is admissible at `now` (unix seconds).
    ///
    /// Fails closed: a ledger query error is reported as a denial, never
    /// as an allowance.
    pub async fn check(&self, db: &Database, user_id: &str, platform: &str, now: i64) -> Admission {
        match self.check_inner(db, user_id, platform, now).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(user_id, platform, "admission check failed, denying: {}", e);
                Admission::Denied {
                    reason: "System error checking posting limits".to_string(),
                }
            }
        }
    }

    async fn check_inner(
        &self,
        db: &Database,
        user_id: &str,
        platform: &str,
        now: i64,
    ) -> crate::error::Result<Admission> {
        let limits = self.limits_for(platform);
        let (day_start, day_end) = utc_day_bounds(now);

        let daily_count = db
            .count_published_between(user_id, platform, day_start, day_end)
            .await?;

        if daily_count >= limits.daily_posts as i64 {
            return Ok(Admission::Denied {
                reason: format!(
                    "Daily limit of {} posts reached for {}",
                    limits.daily_posts, platform
                ),
            });
        }

        if let Some(last_posted_at) = db.last_published_at(user_id, platform).await? {
            let next_allowed = last_posted_at + limits.min_interval_minutes * 60;
            if now < next_allowed {
                let minutes_left = (next_allowed - now + 59) / 60;
                return Ok(Admission::Denied {
                    reason: format!(
                        "Rate limit: wait {} minute{} before posting to {} again",
                        minutes_left,
                        if minutes_left == 1 { "" } else { "s" },
                        platform
                    ),
                });
            }
        }

        Ok(Admission::Allowed)
    }
}

/// Start and end of the UTC calendar day containing `timestamp`.
fn utc_day_bounds(timestamp: i64) -> (i64, i64) {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let day_start = dt
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
        .unwrap_or(timestamp);
    (day_start, day_start + 86_400 - 1)
}
