//! Concurrent claim semantics
//!
//! The claim statement is the only mutual-exclusion primitive for job
//! ownership. These tests race several claimers against a shared store
//! and check that every due job lands in exactly one claimed batch.

use libsyndicast::db::Database;
use libsyndicast::types::{JobStatus, ScheduledJob};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

async fn shared_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("queue.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    (temp_dir, db)
}

fn due_job(offset_secs: i64) -> ScheduledJob {
    let now = chrono::Utc::now().timestamp();
    ScheduledJob::new("user-1", "acct-1", "linkedin", "claim me", now - offset_secs)
}

#[tokio::test]
async fn at_most_one_claimer_wins_a_single_job() {
    let (_temp, db) = shared_db().await;
    let now = chrono::Utc::now().timestamp();

    let job = due_job(5);
    db.create_job(&job).await.unwrap();

    // Eight claimers race for the one due job
    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.claim_due_jobs(now, 50, Duration::from_secs(15))
                .await
                .unwrap()
                .len()
        }));
    }

    let mut total_claims = 0;
    for handle in handles {
        total_claims += handle.await.unwrap();
    }

    assert_eq!(total_claims, 1, "exactly one claimer may win the job");

    let stored = db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
}

#[tokio::test]
async fn concurrent_claimers_partition_the_due_set() {
    let (_temp, db) = shared_db().await;
    let now = chrono::Utc::now().timestamp();

    let mut job_ids = HashSet::new();
    for i in 0..12 {
        let job = due_job(60 + i);
        job_ids.insert(job.id.clone());
        db.create_job(&job).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.claim_due_jobs(now, 50, Duration::from_secs(15))
                .await
                .unwrap()
                .into_iter()
                .map(|job| job.id)
                .collect::<Vec<_>>()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "a job was claimed by two claimers");
        }
    }

    assert_eq!(seen, job_ids, "no due job may be lost");
}

#[tokio::test]
async fn repeated_claims_drain_the_queue_without_duplication() {
    let (_temp, db) = shared_db().await;
    let now = chrono::Utc::now().timestamp();

    for i in 0..9 {
        db.create_job(&due_job(10 + i)).await.unwrap();
    }

    // Small batches until the queue is dry
    let mut total = 0;
    loop {
        let claimed = db
            .claim_due_jobs(now, 4, Duration::from_secs(15))
            .await
            .unwrap();
        if claimed.is_empty() {
            break;
        }
        total += claimed.len();
    }

    assert_eq!(total, 9);
}

#[tokio::test]
async fn stale_recovery_returns_wedged_jobs_exactly_once() {
    let (_temp, db) = shared_db().await;
    let now = chrono::Utc::now().timestamp();

    // Three jobs claimed, then their worker "crashes"
    for i in 0..3 {
        db.create_job(&due_job(10 + i)).await.unwrap();
    }
    let claimed = db
        .claim_due_jobs(now, 50, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 3);

    sqlx::query("UPDATE scheduled_jobs SET updated_at = ?")
        .bind(now - 45 * 60)
        .execute(db.pool())
        .await
        .unwrap();

    let cutoff = now - 30 * 60;

    // Two recoverers race; the recovered total must be exactly 3
    let db_a = db.clone();
    let db_b = db.clone();
    let (a, b) = tokio::join!(
        async move { db_a.recover_stale_jobs(cutoff, now).await.unwrap() },
        async move { db_b.recover_stale_jobs(cutoff, now).await.unwrap() },
    );
    assert_eq!(a + b, 3, "recovery must be exactly-once, not duplicated");

    for job in &claimed {
        let stored = db.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }
}
