//! Publish orchestration for claimed jobs
//!
//! Runs the per-job pipeline after a job has been claimed and admitted:
//! idempotency short-circuit, content validation, author identity
//! resolution (cached on the account), preview image resolution, and the
//! per-target fan-out with duplicate rescue. Only this module moves a job
//! from processing to published/partial; all-targets-failed and terminal
//! validation outcomes are reported back to the worker, which owns the
//! failure bookkeeping.

use secrecy::SecretString;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{PublishError, Result};
use crate::media;
use crate::platforms::{PublishRequest, PublishTarget, PublisherRegistry};
use crate::types::{JobStatus, PublishReport, PublishStatus, ScheduledJob};

/// Upper bound on one platform publish call.
const PUBLISH_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Spacing between consecutive target calls in a fan-out.
const INTER_TARGET_DELAY: Duration = Duration::from_millis(500);

pub struct Publisher {
    db: Database,
    registry: PublisherRegistry,
    http: reqwest::Client,
}

impl Publisher {
    pub fn new(db: Database, registry: PublisherRegistry) -> Self {
        Self {
            db,
            registry,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &PublisherRegistry {
        &self.registry
    }

    /// Publish a claimed job across all of its targets.
    ///
    /// `Ok(report)` describes the per-target outcome; on published/partial
    /// the job row and the publish-history ledger are already updated.
    /// `Err` carries pre-flight failures: non-transient ones (validation,
    /// unknown platform) must be treated as terminal by the caller.
    pub async fn publish_job(
        &self,
        job: &ScheduledJob,
        access_token: &SecretString,
    ) -> Result<PublishReport> {
        // Idempotency: a job that already recorded external ids was
        // published by an earlier dispatch; do not post it again. The row
        // is still finalized in case the earlier pass died mid-cycle.
        if !job.external_post_ids.is_empty() {
            info!(
                job_id = %job.id,
                ids = ?job.external_post_ids,
                "job already published, skipping re-post"
            );
            let now = chrono::Utc::now().timestamp();
            self.db
                .mark_job_published(
                    &job.id,
                    JobStatus::Published,
                    &job.external_post_ids,
                    &[],
                    now,
                )
                .await?;
            return Ok(PublishReport {
                status: PublishStatus::Published,
                external_ids: job.external_post_ids.clone(),
                errors: Vec::new(),
            });
        }

        let platform = self
            .registry
            .get(&job.platform)
            .ok_or_else(|| PublishError::UnknownPlatform(job.platform.clone()))?;

        // Content validation precedes every network call
        if let Some(limit) = platform.character_limit() {
            if job.content_text.chars().count() > limit {
                return Err(PublishError::Validation(format!(
                    "content exceeds {} character limit for {}",
                    limit, job.platform
                ))
                .into());
            }
        }
        if job.content_text.is_empty() && job.media_url.is_none() {
            return Err(PublishError::Validation(
                "post content cannot be empty (must have text or media)".to_string(),
            )
            .into());
        }

        let targets = self.targets_for(job)?;

        let author_id = self.resolve_author_id(job, platform.as_ref(), access_token).await?;

        let thumbnail_url = if job.media_url.is_some() {
            media::resolve_thumbnail(&self.http, job).await
        } else {
            None
        };

        let mut external_ids = Vec::new();
        let mut errors = Vec::new();

        for (index, target) in targets.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(INTER_TARGET_DELAY).await;
            }

            let request = PublishRequest {
                job,
                author_id: &author_id,
                access_token,
                thumbnail_url: thumbnail_url.as_deref(),
                target: target.clone(),
            };

            match tokio::time::timeout(PUBLISH_CALL_TIMEOUT, platform.publish(&request)).await {
                Ok(Ok(external_id)) => {
                    info!(job_id = %job.id, %target, external_id, "published");
                    external_ids.push(external_id);
                }
                Ok(Err(PublishError::Duplicate { existing_id })) => {
                    // The object already exists; adopting its id is the
                    // success we were after.
                    info!(
                        job_id = %job.id,
                        %target,
                        existing_id,
                        "duplicate rescue: adopting existing post id"
                    );
                    external_ids.push(existing_id);
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, %target, "publish failed: {}", e);
                    errors.push(format!("{} failed: {}", target, e));
                }
                Err(_) => {
                    warn!(job_id = %job.id, %target, "publish timed out");
                    errors.push(format!(
                        "{} failed: publish timed out after {}s",
                        target,
                        PUBLISH_CALL_TIMEOUT.as_secs()
                    ));
                }
            }
        }

        let report = PublishReport::from_results(external_ids, errors);

        if report.status != PublishStatus::Failed {
            let now = chrono::Utc::now().timestamp();
            let job_status = match report.status {
                PublishStatus::Published => JobStatus::Published,
                PublishStatus::Partial => JobStatus::Partial,
                PublishStatus::Failed => unreachable!(),
            };
            self.db
                .mark_job_published(&job.id, job_status, &report.external_ids, &report.errors, now)
                .await?;
            self.db
                .record_post_history(
                    &job.user_id,
                    &job.platform,
                    report.external_ids.first().map(|s| s.as_str()),
                    now,
                )
                .await?;
        }

        Ok(report)
    }

    fn targets_for(&self, job: &ScheduledJob) -> Result<Vec<PublishTarget>> {
        match job.target_type {
            crate::types::TargetType::Feed => Ok(vec![PublishTarget::Feed]),
            crate::types::TargetType::Group => {
                if job.target_ids.is_empty() {
                    return Err(PublishError::Validation(
                        "group post has no target groups".to_string(),
                    )
                    .into());
                }
                Ok(job
                    .target_ids
                    .iter()
                    .map(|id| PublishTarget::Group(id.clone()))
                    .collect())
            }
        }
    }

    /// Use the cached author identity when it is well-formed; otherwise
    /// resolve it once and write it back to the account record.
    async fn resolve_author_id(
        &self,
        job: &ScheduledJob,
        platform: &dyn crate::platforms::PlatformPublisher,
        access_token: &SecretString,
    ) -> Result<String> {
        let account = self.db.get_account(&job.account_id).await?;

        if let Some(account) = &account {
            if let Some(cached) = &account.platform_account_id {
                if platform.is_valid_author_id(cached) {
                    return Ok(cached.clone());
                }
                info!(
                    account_id = %account.id,
                    cached,
                    "cached author identity is malformed, re-resolving"
                );
            }
        }

        match platform.resolve_author(access_token).await {
            Ok(Some(author_id)) => {
                if let Some(account) = &account {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(e) = self
                        .db
                        .cache_account_identity(&account.id, &author_id, now)
                        .await
                    {
                        warn!(account_id = %account.id, "failed to cache author identity: {}", e);
                    }
                }
                Ok(author_id)
            }
            // Platform has no author concept
            Ok(None) => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyndicastError;
    use crate::platforms::mock::MockPlatform;
    use crate::types::{AccountStatus, SocialAccount, TargetType};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    async fn seed_account(db: &Database) {
        let now = chrono::Utc::now().timestamp();
        db.create_account(&SocialAccount {
            id: "acct-1".to_string(),
            user_id: "user-1".to_string(),
            platform: "mock".to_string(),
            platform_account_id: None,
            encrypted_access_token: None,
            encrypted_refresh_token: None,
            expires_at: None,
            status: AccountStatus::Active,
            last_verified_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    }

    fn publisher_with(db: Database, platform: Arc<MockPlatform>) -> Publisher {
        let mut registry = PublisherRegistry::new();
        registry.register(platform);
        Publisher::new(db, registry)
    }

    fn job() -> ScheduledJob {
        let now = chrono::Utc::now().timestamp();
        let mut job = ScheduledJob::new("user-1", "acct-1", "mock", "hello world", now - 1);
        job.status = JobStatus::Processing;
        job
    }

    fn token() -> SecretString {
        SecretString::from("access-token")
    }

    #[tokio::test]
    async fn test_publish_feed_job_success() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock"));
        let publisher = publisher_with(db.clone(), platform.clone());

        let job = job();
        db.create_job(&job).await.unwrap();

        let report = publisher.publish_job(&job, &token()).await.unwrap();
        assert_eq!(report.status, PublishStatus::Published);
        assert_eq!(report.external_ids.len(), 1);
        assert_eq!(platform.call_count(), 1);

        // Job row updated, ledger appended
        let stored = db.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Published);
        assert_eq!(stored.external_post_ids, report.external_ids);
        let count = db
            .count_published_between("user-1", "mock", 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_idempotent_publish_makes_no_call() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock"));
        let publisher = publisher_with(db.clone(), platform.clone());

        let mut job = job();
        job.external_post_ids = vec!["mock:earlier:1".to_string()];
        db.create_job(&job).await.unwrap();

        let report = publisher.publish_job(&job, &token()).await.unwrap();
        assert_eq!(report.status, PublishStatus::Published);
        assert_eq!(report.external_ids, vec!["mock:earlier:1"]);
        assert_eq!(platform.call_count(), 0, "idempotent path must not call out");
    }

    #[tokio::test]
    async fn test_unknown_platform_is_terminal() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let publisher = publisher_with(db, Arc::new(MockPlatform::new("mock")));

        let mut unknown = job();
        unknown.platform = "myspace".to_string();

        let result = publisher.publish_job(&unknown, &token()).await;
        match result {
            Err(SyndicastError::Publish(e)) => {
                assert!(matches!(e, PublishError::UnknownPlatform(_)));
                assert!(!e.is_transient());
            }
            other => panic!("expected UnknownPlatform, got {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_over_limit_content_is_terminal() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock").with_limit(10));
        let publisher = publisher_with(db, platform.clone());

        let mut long = job();
        long.content_text = "x".repeat(11);

        let result = publisher.publish_job(&long, &token()).await;
        assert!(matches!(
            result,
            Err(SyndicastError::Publish(PublishError::Validation(_)))
        ));
        assert_eq!(platform.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_content_without_media_is_terminal() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let publisher = publisher_with(db, Arc::new(MockPlatform::new("mock")));

        let mut empty = job();
        empty.content_text = String::new();

        let result = publisher.publish_job(&empty, &token()).await;
        assert!(matches!(
            result,
            Err(SyndicastError::Publish(PublishError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_group_fanout_partial_success() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock"));
        platform.push_result(Ok("mock:group-a".to_string()));
        platform.push_result(Err(PublishError::Api {
            status: 500,
            message: "group unavailable".to_string(),
        }));
        let publisher = publisher_with(db.clone(), platform.clone());

        let mut fanout = job();
        fanout.target_type = TargetType::Group;
        fanout.target_ids = vec!["a".to_string(), "b".to_string()];
        db.create_job(&fanout).await.unwrap();

        let report = publisher.publish_job(&fanout, &token()).await.unwrap();
        assert_eq!(report.status, PublishStatus::Partial);
        assert_eq!(report.external_ids, vec!["mock:group-a"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("group b"));
        assert_eq!(platform.call_count(), 2, "one target failing must not stop the rest");

        let stored = db.get_job(&fanout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Partial);
    }

    #[tokio::test]
    async fn test_group_without_targets_is_terminal() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let publisher = publisher_with(db, Arc::new(MockPlatform::new("mock")));

        let mut fanout = job();
        fanout.target_type = TargetType::Group;

        let result = publisher.publish_job(&fanout, &token()).await;
        assert!(matches!(
            result,
            Err(SyndicastError::Publish(PublishError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_all_targets_failed_reports_failure_without_db_write() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock"));
        platform.push_result(Err(PublishError::Network("down".to_string())));
        let publisher = publisher_with(db.clone(), platform);

        let failing = job();
        db.create_job(&failing).await.unwrap();

        let report = publisher.publish_job(&failing, &token()).await.unwrap();
        assert_eq!(report.status, PublishStatus::Failed);
        assert!(report.external_ids.is_empty());

        // Failure bookkeeping belongs to the worker's retry controller
        let stored = db.get_job(&failing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        let count = db
            .count_published_between("user-1", "mock", 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_rescue_adopts_existing_id() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let platform = Arc::new(MockPlatform::new("mock"));
        platform.push_result(Err(PublishError::Duplicate {
            existing_id: "mock:existing:42".to_string(),
        }));
        let publisher = publisher_with(db.clone(), platform);

        let duplicate = job();
        db.create_job(&duplicate).await.unwrap();

        let report = publisher.publish_job(&duplicate, &token()).await.unwrap();
        assert_eq!(report.status, PublishStatus::Published);
        assert_eq!(report.external_ids, vec!["mock:existing:42"]);

        let stored = db.get_job(&duplicate.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Published);
        assert_eq!(stored.external_post_ids, vec!["mock:existing:42"]);
    }

    #[tokio::test]
    async fn test_author_identity_cached_after_first_publish() {
        let (_temp, db) = setup_test_db().await;
        seed_account(&db).await;
        let publisher = publisher_with(db.clone(), Arc::new(MockPlatform::new("mock")));

        let first = job();
        db.create_job(&first).await.unwrap();
        publisher.publish_job(&first, &token()).await.unwrap();

        let account = db.get_account("acct-1").await.unwrap().unwrap();
        assert_eq!(account.platform_account_id.as_deref(), Some("mock:author"));
    }
}
