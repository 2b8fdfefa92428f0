//! syndicast-worker - Background daemon for scheduled publishing
//!
//! Runs the claim-and-publish cycle on a fixed interval against the
//! shared job store. Several instances may run concurrently; the store's
//! claim semantics guarantee each due job is processed by exactly one.

use clap::Parser;
use libsyndicast::config::Config;
use libsyndicast::credentials::{CredentialManager, TokenCipher};
use libsyndicast::db::Database;
use libsyndicast::platforms::linkedin::LinkedInPublisher;
use libsyndicast::platforms::webhook::WebhookPublisher;
use libsyndicast::platforms::PublisherRegistry;
use libsyndicast::publisher::Publisher;
use libsyndicast::rate_limiter::AdmissionControl;
use libsyndicast::worker::Worker;
use libsyndicast::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "syndicast-worker")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
syndicast-worker - Background daemon for scheduled publishing

DESCRIPTION:
    syndicast-worker is a long-running daemon that claims due jobs from
    the Syndicast queue and publishes them to their platforms.

    Each cycle it recovers stale jobs, claims a bounded batch of due work,
    enforces per-account rate limits, keeps OAuth tokens fresh, publishes
    with idempotency and duplicate rescue, and retries failures up to a
    fixed ceiling. Multiple worker processes can safely share one queue.

USAGE:
    # Run in foreground (logs to stderr)
    syndicast-worker

    # Run with custom poll interval
    syndicast-worker --poll-interval 30

    # Process due jobs once and exit
    syndicast-worker --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes current cycle)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml

    Override with environment variables:
        SYNDICAST_CONFIG      - Path to config file
        SYNDICAST_MASTER_KEY  - Token encryption key
        SYNDICAST_LOG_FORMAT  - text, json, or pretty
        SYNDICAST_LOG_LEVEL   - error, warn, info, debug, trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or credential error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to run a scheduler cycle (default: 60)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one cycle and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(verbose: bool) {
    use libsyndicast::logging::{LogFormat, LoggingConfig};

    let format = std::env::var("SYNDICAST_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("SYNDICAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, verbose).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    // Fail fast on a missing or weak encryption key, before touching jobs
    let master_key = config.encryption.resolve_master_key()?;
    let cipher = TokenCipher::new(master_key)?;

    let db = Database::new(&config.database.path).await?;

    info!("syndicast-worker starting");

    let worker = build_worker(&config, db, cipher);

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli.poll_interval.unwrap_or(config.worker.poll_interval);
    info!("poll interval: {}s", poll_interval);

    if cli.once {
        worker.run_cycle().await;
        info!("syndicast-worker: ran one cycle, exiting");
    } else {
        run_daemon_loop(&worker, poll_interval, shutdown).await;
    }

    info!("syndicast-worker stopped");
    Ok(())
}

fn build_worker(config: &Config, db: Database, cipher: TokenCipher) -> Worker {
    let notifier = libsyndicast::notify::from_config(&config.notifications);

    let credentials = CredentialManager::new(
        db.clone(),
        cipher,
        config.providers.clone(),
        notifier,
    );

    let mut registry = PublisherRegistry::new();
    registry.register(Arc::new(LinkedInPublisher::new()));
    if let Some(relay_url) = &config.relay.webhook_url {
        for platform in &config.relay.platforms {
            registry.register(Arc::new(WebhookPublisher::new(
                platform.clone(),
                relay_url.clone(),
                config.relay.webhook_secret.clone(),
            )));
        }
    }
    info!(platforms = ?registry.names(), "registered platform publishers");

    let publisher = Publisher::new(db.clone(), registry);
    let admission = AdmissionControl::new(config.effective_limits());

    Worker::new(db, admission, credentials, publisher, config.worker.batch_size)
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libsyndicast::SyndicastError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Main daemon loop
async fn run_daemon_loop(worker: &Worker, poll_interval: u64, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping daemon loop");
            break;
        }

        worker.run_cycle().await;

        // Sleep until next poll, checking for shutdown every second
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}
