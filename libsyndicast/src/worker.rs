//! The scheduled-publishing worker
//!
//! One `run_cycle` call is one scheduler tick: probe the store, recover
//! stale jobs, claim a batch of due work, and push every claimed job
//! through admission, credentials and publish. Per-job errors are
//! recorded on the job and never abort the batch; per-tick infrastructure
//! errors abort only that tick. The re-entrancy flag is cleared on every
//! exit path, including panics, via a drop guard.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::credentials::CredentialManager;
use crate::db::Database;
use crate::error::SyndicastError;
use crate::publisher::Publisher;
use crate::rate_limiter::{Admission, AdmissionControl};
use crate::types::{CycleLog, JobStatus, PublishStatus, ScheduledJob};

/// A job's third recorded failure is terminal.
pub const RETRY_CEILING: i64 = 3;

/// Processing jobs untouched for this long are assumed orphaned.
const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Forward shift applied to rate-limited jobs so they stop hot-looping.
const ADMISSION_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Bound on the pre-tick liveness probe.
const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the claim statement.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one tick.
#[derive(Debug)]
pub enum CycleOutcome {
    /// A previous tick was still running; nothing was done.
    Skipped,
    /// The job store was unreachable or the claim timed out; nothing was touched.
    Aborted,
    /// No due jobs; the tick exited without writing a cycle log.
    Idle,
    /// Work was done; counters as recorded in the cycle log.
    Completed(CycleLog),
}

enum JobOutcome {
    Published,
    Deferred,
    Retried,
    Failed,
}

/// Clears the re-entrancy flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Worker {
    db: Database,
    admission: AdmissionControl,
    credentials: CredentialManager,
    publisher: Publisher,
    batch_size: i64,
    tick_active: AtomicBool,
    probe_failures: AtomicU32,
}

impl Worker {
    pub fn new(
        db: Database,
        admission: AdmissionControl,
        credentials: CredentialManager,
        publisher: Publisher,
        batch_size: i64,
    ) -> Self {
        Self {
            db,
            admission,
            credentials,
            publisher,
            batch_size,
            tick_active: AtomicBool::new(false),
            probe_failures: AtomicU32::new(0),
        }
    }

    /// Execute one scheduler tick.
    ///
    /// Never propagates an error: everything is absorbed into the outcome
    /// so the daemon loop cannot be killed by a bad cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        // Non-reentrant: a tick still in flight wins, the new one is skipped
        if self.tick_active.swap(true, Ordering::SeqCst) {
            info!("previous cycle still in progress, skipping tick");
            return CycleOutcome::Skipped;
        }
        let _guard = TickGuard(&self.tick_active);

        let started = Instant::now();
        let started_at = chrono::Utc::now().timestamp();

        if let Err(e) = self.db.ping(DB_PROBE_TIMEOUT).await {
            let failures = self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
            // Back off the diagnostic logging, keep retrying every tick
            if failures == 1 || failures % 10 == 0 {
                error!(consecutive_failures = failures, "job store unreachable: {}", e);
            }
            return CycleOutcome::Aborted;
        }
        self.probe_failures.store(0, Ordering::Relaxed);

        // Best-effort: recovery problems must not abort the tick
        let now = chrono::Utc::now().timestamp();
        let stale_cutoff = now - STALE_AFTER.as_secs() as i64;
        match self.db.recover_stale_jobs(stale_cutoff, now).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "recovered stale scheduled jobs"),
            Err(e) => warn!("stale job recovery failed: {}", e),
        }

        let claimed = match self.db.claim_due_jobs(now, self.batch_size, CLAIM_TIMEOUT).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("claim query failed, aborting tick: {}", e);
                return CycleOutcome::Aborted;
            }
        };

        if claimed.is_empty() {
            return CycleOutcome::Idle;
        }

        info!(count = claimed.len(), "claimed due jobs");

        let mut published = 0i64;
        let mut failed = 0i64;
        let mut errors_count = 0i64;
        let processed = claimed.len() as i64;

        for job in &claimed {
            let drift_ms = (chrono::Utc::now().timestamp() - job.scheduled_at) * 1000;
            info!(job_id = %job.id, platform = %job.platform, drift_ms, "processing job");

            match self.process_job(job).await {
                JobOutcome::Published => published += 1,
                JobOutcome::Deferred => {}
                JobOutcome::Retried => {
                    failed += 1;
                    errors_count += 1;
                }
                JobOutcome::Failed => {
                    failed += 1;
                    errors_count += 1;
                }
            }
        }

        let finished_at = chrono::Utc::now().timestamp();
        let log = CycleLog {
            started_at,
            finished_at,
            processed,
            published,
            failed,
            execution_time_ms: started.elapsed().as_millis() as i64,
            errors_count,
        };

        if let Err(e) = self.db.record_cycle(&log).await {
            error!("failed to save cycle log: {}", e);
        }

        info!(
            processed = log.processed,
            published = log.published,
            failed = log.failed,
            execution_time_ms = log.execution_time_ms,
            "cycle complete"
        );

        CycleOutcome::Completed(log)
    }

    /// Run one claimed job through admission, credentials and publish.
    async fn process_job(&self, job: &ScheduledJob) -> JobOutcome {
        let now = chrono::Utc::now().timestamp();

        // Admission: a denial is a deferral, not a failure
        match self
            .admission
            .check(&self.db, &job.user_id, &job.platform, now)
            .await
        {
            Admission::Allowed => {}
            Admission::Denied { reason } => {
                info!(job_id = %job.id, "admission denied: {}", reason);
                let deferred_to = now + ADMISSION_COOLDOWN.as_secs() as i64;
                if let Err(e) = self.db.defer_job(&job.id, deferred_to, &reason, now).await {
                    warn!(job_id = %job.id, "failed to defer job: {}", e);
                }
                return JobOutcome::Deferred;
            }
        }

        let token = match self.credentials.get_valid_token(&job.account_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return self
                    .record_failure(job, "no valid access token available", now)
                    .await;
            }
            Err(e) => {
                return self.record_failure(job, &e.to_string(), now).await;
            }
        };

        match self.publisher.publish_job(job, &token).await {
            Ok(report) => match report.status {
                PublishStatus::Published | PublishStatus::Partial => JobOutcome::Published,
                PublishStatus::Failed => {
                    let message = report.errors.join(" | ");
                    self.record_failure(job, &message, now).await
                }
            },
            Err(SyndicastError::Publish(e)) if !e.is_transient() => {
                // Deterministic failure: retrying can never succeed
                warn!(job_id = %job.id, "terminal publish failure: {}", e);
                if let Err(db_err) = self.db.mark_job_failed(&job.id, &e.to_string(), now).await {
                    warn!(job_id = %job.id, "failed to record terminal failure: {}", db_err);
                }
                JobOutcome::Failed
            }
            Err(e) => self.record_failure(job, &e.to_string(), now).await,
        }
    }

    /// Retry controller: bump the attempt count and either requeue or fail.
    async fn record_failure(&self, job: &ScheduledJob, message: &str, now: i64) -> JobOutcome {
        warn!(job_id = %job.id, "publish attempt failed: {}", message);

        match self
            .db
            .record_failure(&job.id, message, RETRY_CEILING, now)
            .await
        {
            Ok(JobStatus::Pending) => JobOutcome::Retried,
            Ok(_) => JobOutcome::Failed,
            Err(e) => {
                // The claim flip already persisted `processing`; stale
                // recovery will pick the job up if this write keeps failing.
                error!(job_id = %job.id, "failed to record job failure: {}", e);
                JobOutcome::Failed
            }
        }
    }
}
