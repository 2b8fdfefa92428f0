//! syndicast-queue - Manage the scheduled publishing queue
//!
//! Operator tool for inspecting and adjusting scheduled jobs.

use clap::{Parser, Subcommand};
use libsyndicast::types::JobStatus;
use libsyndicast::{Config, Database, Result, ScheduledJob, SyndicastError};

#[derive(Parser, Debug)]
#[command(name = "syndicast-queue")]
#[command(version)]
#[command(about = "Manage the scheduled publishing queue")]
#[command(long_about = "\
syndicast-queue - Manage the scheduled publishing queue

DESCRIPTION:
    syndicast-queue inspects and adjusts jobs in the Syndicast queue.
    Use it to list jobs, cancel pending work, reschedule, re-arm failed
    jobs, or view queue statistics.

USAGE EXAMPLES:
    # List pending jobs
    syndicast-queue list

    # List failed jobs as JSON
    syndicast-queue list --status failed --format json

    # Cancel a pending job
    syndicast-queue cancel <JOB_ID>

    # Reschedule a pending job
    syndicast-queue reschedule <JOB_ID> \"tomorrow 3pm\"

    # Give a failed job a fresh retry budget
    syndicast-queue retry <JOB_ID>

    # View queue statistics
    syndicast-queue stats

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    Override with SYNDICAST_CONFIG.

EXIT CODES:
    0 - Success
    1 - Operation or database error
    2 - Configuration or credential error
    3 - Invalid input (bad job ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List scheduled jobs
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by status (pending, processing, published, partial, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },

    /// Cancel a pending job
    Cancel {
        /// Job ID to cancel
        job_id: String,
    },

    /// Reschedule a pending job
    Reschedule {
        /// Job ID to reschedule
        job_id: String,

        /// New schedule time (e.g. "tomorrow 3pm", "+2h", "now")
        time: String,
    },

    /// Re-arm a failed job with a fresh retry budget
    Retry {
        /// Job ID to retry
        job_id: String,

        /// When to run it (default: now)
        #[arg(default_value = "now")]
        time: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("error")
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    match cli.command {
        Commands::List {
            format,
            status,
            limit,
        } => cmd_list(&db, &format, status.as_deref(), limit).await?,
        Commands::Cancel { job_id } => cmd_cancel(&db, &job_id).await?,
        Commands::Reschedule { job_id, time } => cmd_reschedule(&db, &job_id, &time).await?,
        Commands::Retry { job_id, time } => cmd_retry(&db, &job_id, &time).await?,
        Commands::Stats { format } => cmd_stats(&db, &format).await?,
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(SyndicastError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn parse_status(status: &str) -> Result<JobStatus> {
    let parsed = JobStatus::parse(status);
    // JobStatus::parse maps anything unknown to Pending; reject typos here
    if parsed == JobStatus::Pending && status != "pending" {
        return Err(SyndicastError::InvalidInput(format!(
            "Unknown status '{}'",
            status
        )));
    }
    Ok(parsed)
}

/// List scheduled jobs
async fn cmd_list(db: &Database, format: &str, status: Option<&str>, limit: i64) -> Result<()> {
    validate_format(format)?;

    let status = status.map(parse_status).transpose()?;
    let jobs = db.list_jobs(status, limit).await?;

    if format == "json" {
        output_list_json(&jobs);
    } else {
        output_list_text(&jobs);
    }

    Ok(())
}

fn output_list_json(jobs: &[ScheduledJob]) {
    let json: Vec<serde_json::Value> = jobs
        .iter()
        .map(|job| {
            serde_json::json!({
                "id": job.id,
                "platform": job.platform,
                "content": job.content_text,
                "scheduled_at": job.scheduled_at,
                "status": job.status.as_str(),
                "retry_count": job.retry_count,
                "last_error": job.last_error,
                "external_post_ids": job.external_post_ids,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json).unwrap());
}

fn output_list_text(jobs: &[ScheduledJob]) {
    if jobs.is_empty() {
        return;
    }

    let now = chrono::Utc::now().timestamp();

    for job in jobs {
        println!(
            "{} | {} | {} | {} | {}",
            job.id,
            job.platform,
            job.status,
            truncate_content(&job.content_text, 50),
            format_time_until(now, job.scheduled_at)
        );
    }
}

/// Truncate content to max length with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        let truncated: String = content.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}

/// Format time until scheduled time in human-readable form
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

/// Cancel a pending job
async fn cmd_cancel(db: &Database, job_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    if db.cancel_job(job_id, now).await? {
        println!("Cancelled job {}", job_id);
        return Ok(());
    }

    match db.get_job(job_id).await? {
        Some(job) => Err(SyndicastError::InvalidInput(format!(
            "Job {} is {} and cannot be cancelled (only pending jobs can)",
            job_id, job.status
        ))),
        None => Err(SyndicastError::InvalidInput(format!(
            "Job {} not found",
            job_id
        ))),
    }
}

/// Reschedule a pending job
async fn cmd_reschedule(db: &Database, job_id: &str, time: &str) -> Result<()> {
    let scheduled_at = libsyndicast::scheduling::parse_schedule(time)?.timestamp();
    let now = chrono::Utc::now().timestamp();

    if db.reschedule_job(job_id, scheduled_at, now).await? {
        println!("Rescheduled job {} to {}", job_id, scheduled_at);
        Ok(())
    } else {
        Err(SyndicastError::InvalidInput(format!(
            "Job {} not found or not pending",
            job_id
        )))
    }
}

/// Re-arm a failed job
async fn cmd_retry(db: &Database, job_id: &str, time: &str) -> Result<()> {
    let scheduled_at = libsyndicast::scheduling::parse_schedule(time)?.timestamp();
    let now = chrono::Utc::now().timestamp();

    if db.retry_failed_job(job_id, scheduled_at, now).await? {
        println!("Re-armed job {} for retry", job_id);
        Ok(())
    } else {
        Err(SyndicastError::InvalidInput(format!(
            "Job {} not found or not failed",
            job_id
        )))
    }
}

/// Show queue statistics
async fn cmd_stats(db: &Database, format: &str) -> Result<()> {
    validate_format(format)?;

    let stats = db.queue_stats().await?;
    let next_due = db.next_due_at().await?;

    if format == "json" {
        let counts: serde_json::Map<String, serde_json::Value> = stats
            .iter()
            .map(|(status, count)| (status.clone(), serde_json::json!(count)))
            .collect();
        let output = serde_json::json!({
            "counts": counts,
            "next_due_at": next_due,
        });
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
    } else {
        if stats.is_empty() {
            println!("Queue is empty");
            return Ok(());
        }
        for (status, count) in &stats {
            println!("{:12} {}", status, count);
        }
        if let Some(due) = next_due {
            let now = chrono::Utc::now().timestamp();
            println!("next due    {}", format_time_until(now, due));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 50), "short");
        let long = "a".repeat(60);
        let truncated = truncate_content(&long, 50);
        assert_eq!(truncated.len(), 53);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(100, 50), "overdue");
        assert_eq!(format_time_until(0, 30), "in <1 minute");
        assert_eq!(format_time_until(0, 120), "in 2 minutes");
        assert_eq!(format_time_until(0, 7200), "in 2 hours");
        assert_eq!(format_time_until(0, 86_400), "in 1 day");
    }

    #[test]
    fn test_parse_status_rejects_unknown() {
        assert!(parse_status("pending").is_ok());
        assert!(parse_status("failed").is_ok());
        assert!(parse_status("bogus").is_err());
    }
}
