//! End-to-end worker cycles against a shared store
//!
//! Drives the full pipeline (claim, admission, credentials, publish,
//! retry accounting, cycle logs) with mock platforms, plus one test with
//! the real LinkedIn client and token endpoint stubbed over HTTP.

use libsyndicast::config::{default_limits, ProviderConfig};
use libsyndicast::credentials::{CredentialManager, TokenCipher};
use libsyndicast::db::Database;
use libsyndicast::notify::NoopNotifier;
use libsyndicast::platforms::linkedin::LinkedInPublisher;
use libsyndicast::platforms::mock::MockPlatform;
use libsyndicast::platforms::PublisherRegistry;
use libsyndicast::publisher::Publisher;
use libsyndicast::rate_limiter::AdmissionControl;
use libsyndicast::types::{AccountStatus, JobStatus, ScheduledJob, SocialAccount};
use libsyndicast::worker::{CycleOutcome, Worker};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cipher() -> TokenCipher {
    TokenCipher::new(SecretString::from("integration-test-master-key")).unwrap()
}

async fn shared_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("queue.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    (temp_dir, db)
}

async fn seed_account(db: &Database, platform: &str) {
    let now = chrono::Utc::now().timestamp();
    let cipher = cipher();
    db.create_account(&SocialAccount {
        id: "acct-1".to_string(),
        user_id: "user-1".to_string(),
        platform: platform.to_string(),
        platform_account_id: Some("urn:li:person:cached".to_string()),
        encrypted_access_token: Some(cipher.encrypt("access-token").unwrap()),
        encrypted_refresh_token: Some(cipher.encrypt("refresh-token").unwrap()),
        expires_at: Some(now + 86_400),
        status: AccountStatus::Active,
        last_verified_at: None,
        metadata: None,
        created_at: now,
        updated_at: now - 600,
    })
    .await
    .unwrap();
}

fn worker_with_mock(db: Database, platform: Arc<MockPlatform>) -> Worker {
    let credentials =
        CredentialManager::new(db.clone(), cipher(), HashMap::new(), Arc::new(NoopNotifier));
    let mut registry = PublisherRegistry::new();
    registry.register(platform);
    let publisher = Publisher::new(db.clone(), registry);

    // The mock platform gets burst-friendly limits so spacing rules only
    // apply where a test wants them (the real-platform entries stay).
    let mut limits = default_limits();
    limits.insert(
        "mock".to_string(),
        libsyndicast::config::PlatformLimits {
            daily_posts: 1000,
            min_interval_minutes: 0,
        },
    );

    Worker::new(
        db,
        AdmissionControl::new(limits),
        credentials,
        publisher,
        50,
    )
}

fn due_job(platform: &str, offset_secs: i64) -> ScheduledJob {
    let now = chrono::Utc::now().timestamp();
    ScheduledJob::new(
        "user-1",
        "acct-1",
        platform,
        format!("post due {}s ago", offset_secs),
        now - offset_secs,
    )
}

#[tokio::test]
async fn two_workers_share_a_queue_without_double_publish() {
    let (_temp, db) = shared_db().await;
    // linkedin limits allow 25/day but require 15 minute gaps; use a
    // platform with no interval pressure instead
    seed_account(&db, "mock").await;

    let mut job_ids = Vec::new();
    for i in 0..6 {
        let job = due_job("mock", 60 + i);
        job_ids.push(job.id.clone());
        db.create_job(&job).await.unwrap();
    }

    let platform_a = Arc::new(MockPlatform::new("mock"));
    let platform_b = Arc::new(MockPlatform::new("mock"));
    let worker_a = worker_with_mock(db.clone(), platform_a.clone());
    let worker_b = worker_with_mock(db.clone(), platform_b.clone());

    let (outcome_a, outcome_b) = tokio::join!(worker_a.run_cycle(), worker_b.run_cycle());

    let published = |outcome: &CycleOutcome| match outcome {
        CycleOutcome::Completed(log) => log.published,
        _ => 0,
    };
    assert_eq!(published(&outcome_a) + published(&outcome_b), 6);

    // Exactly one external call per job across both workers
    assert_eq!(platform_a.call_count() + platform_b.call_count(), 6);

    for id in &job_ids {
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Published);
        assert_eq!(job.external_post_ids.len(), 1);
    }
}

#[tokio::test]
async fn interval_spacing_defers_the_second_job_of_a_burst() {
    let (_temp, db) = shared_db().await;
    seed_account(&db, "linkedin").await;

    // Two due jobs for the same linkedin account, 15 minute minimum gap
    let job_a = due_job("linkedin", 120);
    let job_b = due_job("linkedin", 60);
    db.create_job(&job_a).await.unwrap();
    db.create_job(&job_b).await.unwrap();

    let platform = Arc::new(MockPlatform::new("linkedin"));
    let worker = worker_with_mock(db.clone(), platform.clone());

    let outcome = worker.run_cycle().await;
    let log = match outcome {
        CycleOutcome::Completed(log) => log,
        other => panic!("expected Completed, got {:?}", other),
    };

    // First publishes, second trips the spacing rule and is deferred
    assert_eq!(log.processed, 2);
    assert_eq!(log.published, 1);
    assert_eq!(log.failed, 0);
    assert_eq!(platform.call_count(), 1);

    let a = db.get_job(&job_a.id).await.unwrap().unwrap();
    let b = db.get_job(&job_b.id).await.unwrap().unwrap();
    assert_eq!(a.status, JobStatus::Published);
    assert_eq!(b.status, JobStatus::Pending);
    assert!(b.last_error.unwrap().contains("wait"));
    assert!(b.scheduled_at > chrono::Utc::now().timestamp());
}

#[tokio::test]
async fn failed_job_is_reclaimed_until_the_ceiling() {
    let (_temp, db) = shared_db().await;
    seed_account(&db, "mock").await;

    let job = due_job("mock", 30);
    db.create_job(&job).await.unwrap();

    let platform = Arc::new(MockPlatform::new("mock"));
    for _ in 0..3 {
        platform.push_result(Err(libsyndicast::PublishError::Network(
            "relay down".to_string(),
        )));
    }
    let worker = worker_with_mock(db.clone(), platform.clone());

    // Three cycles, three failures, then terminal
    for expected_retry in 1..=3 {
        worker.run_cycle().await;
        let stored = db.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, expected_retry);
        if expected_retry < 3 {
            assert_eq!(stored.status, JobStatus::Pending);
        } else {
            assert_eq!(stored.status, JobStatus::Failed);
        }
    }

    // A fourth cycle finds nothing to do
    let outcome = worker.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Idle));
    assert_eq!(platform.call_count(), 3);
}

#[tokio::test]
async fn already_published_job_short_circuits_after_recovery() {
    let (_temp, db) = shared_db().await;
    seed_account(&db, "mock").await;

    // A job that published but whose worker died before finishing the
    // cycle: external id recorded, row wedged in processing
    let now = chrono::Utc::now().timestamp();
    let mut job = due_job("mock", 30);
    job.external_post_ids = vec!["mock:recorded:1".to_string()];
    db.create_job(&job).await.unwrap();
    db.claim_due_jobs(now, 50, std::time::Duration::from_secs(15))
        .await
        .unwrap();
    sqlx::query("UPDATE scheduled_jobs SET updated_at = ? WHERE id = ?")
        .bind(now - 45 * 60)
        .bind(&job.id)
        .execute(db.pool())
        .await
        .unwrap();

    let platform = Arc::new(MockPlatform::new("mock"));
    let worker = worker_with_mock(db.clone(), platform.clone());

    worker.run_cycle().await;

    let stored = db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Published);
    assert_eq!(stored.external_post_ids, vec!["mock:recorded:1"]);
    assert_eq!(platform.call_count(), 0, "idempotent path must not re-post");
}

#[tokio::test]
async fn linkedin_pipeline_with_token_refresh_end_to_end() {
    let api = MockServer::start().await;

    // Token endpoint: one exchange
    Mock::given(method("POST"))
        .and(path("/oauth/accessToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "refreshed-token",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&api)
        .await;

    // Publish endpoint
    Mock::given(method("POST"))
        .and(path("/v2/ugcPosts"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "urn:li:share:9000"
        })))
        .expect(1)
        .mount(&api)
        .await;

    let (_temp, db) = shared_db().await;

    // Account whose token expires inside the refresh buffer
    let now = chrono::Utc::now().timestamp();
    let cipher_instance = cipher();
    db.create_account(&SocialAccount {
        id: "acct-1".to_string(),
        user_id: "user-1".to_string(),
        platform: "linkedin".to_string(),
        platform_account_id: Some("urn:li:person:cached".to_string()),
        encrypted_access_token: Some(cipher_instance.encrypt("stale-token").unwrap()),
        encrypted_refresh_token: Some(cipher_instance.encrypt("refresh-token").unwrap()),
        expires_at: Some(now + 60),
        status: AccountStatus::Active,
        last_verified_at: None,
        metadata: None,
        created_at: now,
        updated_at: now - 600,
    })
    .await
    .unwrap();

    let mut providers = HashMap::new();
    providers.insert(
        "linkedin".to_string(),
        ProviderConfig {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            token_url: format!("{}/oauth/accessToken", api.uri()),
        },
    );
    let credentials =
        CredentialManager::new(db.clone(), cipher(), providers, Arc::new(NoopNotifier));

    let mut registry = PublisherRegistry::new();
    registry.register(Arc::new(LinkedInPublisher::with_api_base(api.uri())));
    let publisher = Publisher::new(db.clone(), registry);

    let worker = Worker::new(
        db.clone(),
        AdmissionControl::new(default_limits()),
        credentials,
        publisher,
        50,
    );

    let job = due_job("linkedin", 30);
    db.create_job(&job).await.unwrap();

    let outcome = worker.run_cycle().await;
    let log = match outcome {
        CycleOutcome::Completed(log) => log,
        other => panic!("expected Completed, got {:?}", other),
    };
    assert_eq!(log.published, 1);

    let stored = db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Published);
    assert_eq!(stored.external_post_ids, vec!["urn:li:share:9000"]);

    // Ledger records the publish for admission control
    let count = db
        .count_published_between("user-1", "linkedin", now - 60, now + 60)
        .await
        .unwrap();
    assert_eq!(count, 1);
}
