use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};
use log::{error, info, trace, warn};

use scanrelay::cli::Cli;
use scanrelay::config::Config;
use scanrelay::database::Database;
use scanrelay::error::ScanRelayError;
use scanrelay::processor::{Processor, ProcessorConfig};
use scanrelay::stats::Stats;
use scanrelay::targets::{self, Target};
use scanrelay::triggers::drive::source::RestChangeSource;
use scanrelay::server;
use scanrelay::triggers::{self, ProcessorFn};

const NO_SCANS_DELAY: Duration = Duration::from_secs(15);

const LOG_MAX_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const LOG_KEEP_FILES: usize = 5;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(&cli);

    let config = match Config::load(&cli.config_path()) {
        Ok(config) => config,
        Err(e) => fatal(&format!("Config load failed: {e}")),
    };

    let db = match Database::open(&cli.database_path()) {
        Ok(db) => Arc::new(db),
        Err(e) => fatal(&format!("Datastore init failed: {e}")),
    };

    let stats = Arc::new(Stats::new());
    let processor = match Processor::new(ProcessorConfig {
        anchors: config.anchors.iter().map(PathBuf::from).collect(),
        minimum_age: Duration::from_secs(config.minimum_age_secs),
        stats: stats.clone(),
        db: db.clone(),
    }) {
        Ok(processor) => Arc::new(processor),
        Err(e) => fatal(&format!("Processor init failed: {e}")),
    };

    info!(
        "Processor initialised (minimum age {}s, {} anchors)",
        config.minimum_age_secs,
        config.anchors.len()
    );

    if !config.auth.enabled() {
        warn!("Webhooks are unauthenticated");
    }

    let callback: ProcessorFn = {
        let processor = processor.clone();
        Arc::new(move |scans| processor.add(scans))
    };

    if let Err(e) = start_daemon_triggers(&config, db.clone(), callback.clone()) {
        fatal(&format!("Trigger init failed: {e}"));
    }

    info!(
        "Triggers initialised (manual 1, drive {}, inotify {}, lidarr {}, radarr {}, sonarr {})",
        config.triggers.drive.len(),
        config.triggers.inotify.len(),
        config.triggers.lidarr.len(),
        config.triggers.radarr.len(),
        config.triggers.sonarr.len()
    );

    let targets = match build_targets(&config).await {
        Ok(targets) => targets,
        Err(e) => fatal(&format!("Target init failed: {e}")),
    };

    info!(
        "Targets initialised (plex {}, emby {}, relay {})",
        config.targets.plex.len(),
        config.targets.emby.len(),
        config.targets.relay.len()
    );

    let ready: server::ReadyFlag = Arc::new(AtomicBool::new(false));
    let router = match server::build_router(&config, callback, ready.clone()) {
        Ok(router) => router,
        Err(e) => fatal(&format!("Router init failed: {e}")),
    };

    for host in &config.host {
        let addr = match parse_bind_addr(host, config.port) {
            Ok(addr) => addr,
            Err(e) => fatal(&format!("Invalid bind address {host:?}: {e}")),
        };

        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, router).await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        });
    }

    if config.scan_stats_secs > 0 {
        tokio::spawn(report_stats(
            stats.clone(),
            processor.clone(),
            Duration::from_secs(config.scan_stats_secs),
        ));
    }

    spawn_signal_handler(processor.clone());

    ready.store(true, Ordering::Relaxed);
    notify_ready();
    info!("scanrelay initialised");

    info!("Processor started");
    run_scan_loop(
        processor,
        targets,
        Duration::from_secs(config.scan_delay_secs),
    )
    .await
}

/// The outermost driver: gates on anchors and target availability, then
/// processes one scan at a time, sleeping according to the outcome.
async fn run_scan_loop(
    processor: Arc<Processor>,
    targets: Vec<Arc<dyn Target>>,
    scan_delay: Duration,
) {
    let mut targets_available = false;

    loop {
        if targets.is_empty() {
            fatal("No targets configured");
        }

        // Anchor gate: if mounts are offline, skip everything.
        if !processor.check_anchors() {
            tokio::time::sleep(NO_SCANS_DELAY).await;
            continue;
        }

        if !targets_available {
            match processor.check_availability(&targets).await {
                Ok(()) => targets_available = true,
                Err(e) if e.is_fatal() => fatal(&format!("Target check failed: {e}")),
                Err(e) => {
                    error!("Targets unavailable: {}", e);
                    tokio::time::sleep(NO_SCANS_DELAY).await;
                    continue;
                }
            }
        }

        match processor.process(&targets).await {
            Ok(()) => {
                // Space out successful dispatches to keep target load sane.
                tokio::time::sleep(scan_delay).await;
            }
            Err(ScanRelayError::NoScans) => {
                trace!("No scans available");
                tokio::time::sleep(NO_SCANS_DELAY).await;
            }
            Err(ScanRelayError::TargetUnavailable(reason)) => {
                processor
                    .stats()
                    .retried
                    .fetch_add(1, Ordering::Relaxed);
                targets_available = false;
                error!("Targets unavailable: {}", reason);
                tokio::time::sleep(NO_SCANS_DELAY).await;
            }
            Err(e) => fatal(&format!("Processing failed: {e}")),
        }
    }
}

/// Periodic counters report, mirrored to the service manager when a
/// notify socket is present.
async fn report_stats(stats: Arc<Stats>, processor: Arc<Processor>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        ticker.tick().await;

        let snapshot = stats.snapshot();
        match processor.remaining() {
            Ok(remaining) => {
                info!(
                    "Scan stats: remaining {} | received {} | processed {} | retried {}",
                    remaining, snapshot.received, snapshot.processed, snapshot.retried
                );

                let status = format!(
                    "remaining: {} | received: {} | processed: {} | retried: {}",
                    remaining, snapshot.received, snapshot.processed, snapshot.retried
                );
                let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status(&status)]);
            }
            Err(e) if e.is_fatal() => {
                error!("Stats reporter stopped: {}", e);
                return;
            }
            Err(e) => error!("Scan stats failed: {}", e),
        }
    }
}

fn start_daemon_triggers(
    config: &Config,
    db: Arc<Database>,
    callback: ProcessorFn,
) -> Result<(), ScanRelayError> {
    for drive_config in &config.triggers.drive {
        let source = RestChangeSource::from_account_file(Path::new(&drive_config.account))
            .map_err(|e| ScanRelayError::Fatal(e.to_string()))?;

        triggers::drive::spawn(
            drive_config.clone(),
            db.clone(),
            Arc::new(source),
            callback.clone(),
        )?;
    }

    for inotify_config in &config.triggers.inotify {
        triggers::inotify::spawn(inotify_config.clone(), callback.clone())?;
    }

    Ok(())
}

async fn build_targets(config: &Config) -> Result<Vec<Arc<dyn Target>>, ScanRelayError> {
    let mut targets: Vec<Arc<dyn Target>> = Vec::new();

    for plex_config in &config.targets.plex {
        let target = targets::plex::PlexTarget::new(plex_config.clone()).await?;
        targets.push(Arc::new(target));
    }

    for emby_config in &config.targets.emby {
        let target = targets::emby::EmbyTarget::new(emby_config.clone()).await?;
        targets.push(Arc::new(target));
    }

    for relay_config in &config.targets.relay {
        let target = targets::relay::RelayTarget::new(relay_config.clone())?;
        targets.push(Arc::new(target));
    }

    Ok(targets)
}

/// SIGINT/SIGTERM close the database and exit immediately; in-flight
/// target calls are not drained.
fn spawn_signal_handler(processor: Arc<Processor>) {
    tokio::spawn(async move {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Signal handler init failed: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal: interrupt"),
            _ = terminate.recv() => info!("Shutdown signal: terminate"),
        }

        processor.close();
        std::process::exit(0);
    });
}

fn notify_ready() {
    match sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        Ok(()) => info!("sd_notify ready sent"),
        Err(e) => trace!("sd_notify unavailable: {}", e),
    }
}

fn parse_bind_addr(host: &str, port: u16) -> Result<SocketAddr, ScanRelayError> {
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };

    addr.parse()
        .map_err(|e| ScanRelayError::Config(format!("{addr}: {e}")))
}

fn setup_logging(cli: &Cli) {
    let result = Logger::try_with_str(cli.log_spec())
        .and_then(|logger| {
            logger
                .log_to_file(FileSpec::default().directory(cli.log_dir_path()))
                .duplicate_to_stderr(Duplicate::All)
                .rotate(
                    Criterion::Size(LOG_MAX_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(LOG_KEEP_FILES),
                )
                .start()
        });

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {e}");
        std::process::exit(1);
    }
}

fn fatal(message: &str) -> ! {
    error!("{}", message);
    eprintln!("{message}");
    std::process::exit(1);
}
