//! Database operations for Syndicast
//!
//! One SQLite database holds the job queue, connected accounts, the
//! publish-history ledger and per-tick execution logs. The claim path is
//! a single conditional UPDATE so that concurrent workers sharing the
//! store can never claim the same job twice (the SQLite equivalent of a
//! `FOR UPDATE SKIP LOCKED` batch on PostgreSQL).

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{
    AccountStatus, CycleLog, JobStatus, ScheduledJob, SocialAccount, TargetType,
};

/// Hard cap on stored error messages.
const MAX_ERROR_LEN: usize = 1000;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Lightweight liveness probe, bounded by `timeout`.
    ///
    /// The worker calls this before every tick; an unreachable store aborts
    /// the tick without touching any job.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let probe = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DbError::Unreachable(e.to_string()).into()),
            Err(_) => Err(DbError::Unreachable(format!(
                "liveness probe exceeded {}s",
                timeout.as_secs()
            ))
            .into()),
        }
    }

    // ========================================================================
    // Job queue
    // ========================================================================

    /// Insert a new scheduled job.
    pub async fn create_job(&self, job: &ScheduledJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (id, user_id, account_id, platform, post_type, content_text, title,
                 media_url, thumbnail_url, target_type, target_ids, scheduled_at,
                 timezone, status, retry_count, last_error, external_post_ids,
                 content_id, published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.account_id)
        .bind(&job.platform)
        .bind(&job.post_type)
        .bind(&job.content_text)
        .bind(&job.title)
        .bind(&job.media_url)
        .bind(&job.thumbnail_url)
        .bind(job.target_type.as_str())
        .bind(encode_string_list(&job.target_ids))
        .bind(job.scheduled_at)
        .bind(&job.timezone)
        .bind(job.status.as_str())
        .bind(job.retry_count)
        .bind(&job.last_error)
        .bind(join_external_ids(&job.external_post_ids))
        .bind(&job.content_id)
        .bind(job.published_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM scheduled_jobs WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| job_from_row(&r)))
    }

    /// Atomically claim up to `limit` due jobs, flipping them to processing.
    ///
    /// Selection and the status flip happen in one statement guarded by
    /// `status = 'pending'`, so when several workers race over the same due
    /// set, each job lands in exactly one claimed batch. Rows come back in
    /// ascending scheduled_at order. A claim that exceeds `timeout` aborts
    /// the whole tick; no partial flips beyond the statement itself exist.
    pub async fn claim_due_jobs(
        &self,
        now: i64,
        limit: i64,
        timeout: Duration,
    ) -> Result<Vec<ScheduledJob>> {
        let query = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'processing', updated_at = ?
            WHERE id IN (
                SELECT id FROM scheduled_jobs
                WHERE status = 'pending' AND scheduled_at <= ?
                ORDER BY scheduled_at ASC
                LIMIT ?
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool);

        let rows = match tokio::time::timeout(timeout, query).await {
            Ok(result) => result.map_err(DbError::SqlxError)?,
            Err(_) => return Err(DbError::Timeout(timeout.as_secs()).into()),
        };

        let mut jobs: Vec<ScheduledJob> = rows.iter().map(job_from_row).collect();
        jobs.sort_by_key(|j| j.scheduled_at);
        Ok(jobs)
    }

    /// Reset jobs wedged in processing since before `cutoff` back to pending.
    ///
    /// Returns the number of recovered jobs.
    pub async fn recover_stale_jobs(&self, cutoff: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'pending',
                last_error = 'Stale job recovery: reset after processing timeout',
                updated_at = ?
            WHERE status = 'processing' AND updated_at <= ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Push a claimed job back to pending at a later due time.
    ///
    /// Used when admission control denies the job; the forward shift keeps
    /// it from hot-looping against the same limit every tick.
    pub async fn defer_job(
        &self,
        job_id: &str,
        new_scheduled_at: i64,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'pending', scheduled_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_scheduled_at)
        .bind(truncate_error(reason))
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Record a failed publish attempt and decide the job's next status.
    ///
    /// retry_count is incremented; below `ceiling` the job returns to
    /// pending (it stays due, so the next tick re-claims it), at or above
    /// it the job is terminally failed. Returns the resulting status.
    pub async fn record_failure(
        &self,
        job_id: &str,
        error: &str,
        ceiling: i64,
        now: i64,
    ) -> Result<JobStatus> {
        let retry_count: i64 = sqlx::query_scalar(
            r#"
            SELECT retry_count FROM scheduled_jobs WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .unwrap_or(0);

        let new_count = retry_count + 1;
        let status = if new_count < ceiling {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };

        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = ?, retry_count = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(new_count)
        .bind(truncate_error(error))
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(status)
    }

    /// Record the outcome of a publish that produced at least one external id.
    pub async fn mark_job_published(
        &self,
        job_id: &str,
        status: JobStatus,
        external_ids: &[String],
        errors: &[String],
        now: i64,
    ) -> Result<()> {
        let error_text = if errors.is_empty() {
            None
        } else {
            Some(truncate_error(&errors.join(" | ")))
        };

        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = ?, external_post_ids = ?, last_error = ?,
                published_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(join_external_ids(external_ids))
        .bind(error_text)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Terminally fail a job without touching its retry budget.
    ///
    /// Used for deterministic failures (content validation, unknown
    /// platform) where retrying can never succeed.
    pub async fn mark_job_failed(&self, job_id: &str, error: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'failed', last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(truncate_error(error))
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Cancel a pending job. Returns false if the job was not pending
    /// (already claimed, finished, or unknown).
    pub async fn cancel_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a pending job to a new due time.
    pub async fn reschedule_job(&self, job_id: &str, scheduled_at: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(scheduled_at)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Give a terminally failed job a fresh retry budget.
    pub async fn retry_failed_job(&self, job_id: &str, scheduled_at: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'pending', retry_count = 0, last_error = NULL,
                scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(scheduled_at)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// List jobs, optionally filtered by status, newest schedule first.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT * FROM scheduled_jobs
                    WHERE status = ?
                    ORDER BY scheduled_at ASC
                    LIMIT ?
                    "#,
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM scheduled_jobs
                    ORDER BY scheduled_at ASC
                    LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(job_from_row).collect())
    }

    /// Per-status job counts plus the next due time, for `queue stats`.
    pub async fn queue_stats(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM scheduled_jobs
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
            .collect())
    }

    /// Earliest pending due time, if any job is waiting.
    pub async fn next_due_at(&self) -> Result<Option<i64>> {
        let next: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(scheduled_at) FROM scheduled_jobs WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(next)
    }

    // ========================================================================
    // Social accounts
    // ========================================================================

    pub async fn create_account(&self, account: &SocialAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts
                (id, user_id, platform, platform_account_id, encrypted_access_token,
                 encrypted_refresh_token, expires_at, status, last_verified_at,
                 metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(&account.platform)
        .bind(&account.platform_account_id)
        .bind(&account.encrypted_access_token)
        .bind(&account.encrypted_refresh_token)
        .bind(account.expires_at)
        .bind(account.status.as_str())
        .bind(account.last_verified_at)
        .bind(&account.metadata)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM social_accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| account_from_row(&r)))
    }

    /// Store a refreshed token pair and mark the account verified.
    ///
    /// A missing new refresh token keeps the previous one (some providers
    /// only rotate it occasionally).
    pub async fn store_refreshed_tokens(
        &self,
        account_id: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE social_accounts
            SET encrypted_access_token = ?,
                encrypted_refresh_token = COALESCE(?, encrypted_refresh_token),
                expires_at = COALESCE(?, expires_at),
                status = 'active',
                last_verified_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encrypted_access_token)
        .bind(encrypted_refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Terminally revoke an account's credentials, recording the cause.
    pub async fn revoke_account(&self, account_id: &str, reason: &str, now: i64) -> Result<()> {
        let metadata = serde_json::json!({ "last_refresh_error": reason }).to_string();

        sqlx::query(
            r#"
            UPDATE social_accounts
            SET status = 'revoked', metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(metadata)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Cache the resolved platform-side author identifier on the account.
    pub async fn cache_account_identity(
        &self,
        account_id: &str,
        platform_account_id: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE social_accounts
            SET platform_account_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(platform_account_id)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // Post history (rate-limit ledger)
    // ========================================================================

    pub async fn record_post_history(
        &self,
        user_id: &str,
        platform: &str,
        external_post_id: Option<&str>,
        posted_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_history (user_id, platform, external_post_id, posted_at, status)
            VALUES (?, ?, ?, ?, 'published')
            "#,
        )
        .bind(user_id)
        .bind(platform.to_lowercase())
        .bind(external_post_id)
        .bind(posted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Count successful posts in `[window_start, window_end]`.
    pub async fn count_published_between(
        &self,
        user_id: &str,
        platform: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM post_history
            WHERE user_id = ? AND platform = ? AND status = 'published'
              AND posted_at >= ? AND posted_at <= ?
            "#,
        )
        .bind(user_id)
        .bind(platform.to_lowercase())
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    /// Timestamp of the most recent successful post, if any.
    pub async fn last_published_at(&self, user_id: &str, platform: &str) -> Result<Option<i64>> {
        let last: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(posted_at) FROM post_history
            WHERE user_id = ? AND platform = ? AND status = 'published'
            "#,
        )
        .bind(user_id)
        .bind(platform.to_lowercase())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(last)
    }

    // ========================================================================
    // Cycle logs
    // ========================================================================

    /// Append one execution-log row. Never updated afterwards.
    pub async fn record_cycle(&self, log: &CycleLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_logs
                (started_at, finished_at, processed, published, failed,
                 execution_time_ms, errors_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.processed)
        .bind(log.published)
        .bind(log.failed)
        .bind(log.execution_time_ms)
        .bind(log.errors_count)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn cycle_log_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cycle_logs")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(count)
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        error.to_string()
    } else {
        error.chars().take(MAX_ERROR_LEN).collect()
    }
}

fn encode_string_list(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(serde_json::to_string(values).unwrap_or_default())
    }
}

fn decode_string_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn join_external_ids(ids: &[String]) -> Option<String> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.join(", "))
    }
}

fn split_external_ids(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(", ")
            .filter(|part| !part.is_empty())
            .map(|part| part.to_string())
            .collect()
    })
    .unwrap_or_default()
}

fn job_from_row(row: &SqliteRow) -> ScheduledJob {
    ScheduledJob {
        id: row.get("id"),
        user_id: row.get("user_id"),
        account_id: row.get("account_id"),
        platform: row.get("platform"),
        post_type: row.get("post_type"),
        content_text: row.get("content_text"),
        title: row.get("title"),
        media_url: row.get("media_url"),
        thumbnail_url: row.get("thumbnail_url"),
        target_type: TargetType::parse(&row.get::<String, _>("target_type")),
        target_ids: decode_string_list(row.get("target_ids")),
        scheduled_at: row.get("scheduled_at"),
        timezone: row.get("timezone"),
        status: JobStatus::parse(&row.get::<String, _>("status")),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        external_post_ids: split_external_ids(row.get("external_post_ids")),
        content_id: row.get("content_id"),
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn account_from_row(row: &SqliteRow) -> SocialAccount {
    SocialAccount {
        id: row.get("id"),
        user_id: row.get("user_id"),
        platform: row.get("platform"),
        platform_account_id: row.get("platform_account_id"),
        encrypted_access_token: row.get("encrypted_access_token"),
        encrypted_refresh_token: row.get("encrypted_refresh_token"),
        expires_at: row.get("expires_at"),
        status: AccountStatus::parse(&row.get::<String, _>("status")),
        last_verified_at: row.get("last_verified_at"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
