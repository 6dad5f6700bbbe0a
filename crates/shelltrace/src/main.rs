//! shelltrace daemon: discovers trace channels written by instrumented
//! shell scripts and drives the collection engine over them.
//!
//! Channels are files (typically fifos) named `<pid>.<parent_pid>` in the
//! configured channel directory. Each refresh pass scans the directory,
//! attaches newcomers, and reconciles instance lifecycles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use shelltrace_core::logging::{LogFormat, init_logging};
use shelltrace_core::{DaemonConfig, Liveness, LivenessProbe, ProcLiveness, TraceEngine};

#[derive(Debug, Parser)]
#[command(name = "st", version, about = "Trace collector for instrumented shell scripts")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "SHELLTRACE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory scanned for `<pid>.<parent_pid>` trace channels.
    #[arg(long)]
    channel_dir: Option<PathBuf>,

    /// Ceiling on bytes retained across all event stores.
    #[arg(long)]
    max_memory: Option<usize>,

    /// Milliseconds between refresh passes.
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Refuse administrative stores on all instances.
    #[arg(long)]
    restricted: bool,

    /// Log output format.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log level filter.
    #[arg(long)]
    log_level: Option<String>,

    /// Run one discovery and refresh pass, print the instance snapshot as
    /// JSON, and exit.
    #[arg(long)]
    once: bool,
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(dir) = &cli.channel_dir {
        config.collect.channel_dir = dir.clone();
    }
    if let Some(bytes) = cli.max_memory {
        config.engine.max_memory_bytes = bytes;
    }
    if let Some(ms) = cli.refresh_interval {
        config.collect.refresh_interval_ms = ms;
    }
    if cli.restricted {
        config.engine.restricted_default = true;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

/// Parse a channel file name of the form `<pid>.<parent_pid>`.
fn parse_channel_name(name: &str) -> Option<(u32, u32)> {
    let (pid, parent) = name.split_once('.')?;
    Some((pid.parse().ok()?, parent.parse().ok()?))
}

/// Pids with a channel open still in flight.
type PendingOpens = Arc<Mutex<HashSet<u32>>>;

fn lock_pending(pending: &PendingOpens) -> MutexGuard<'_, HashSet<u32>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Attach every channel in `dir` that is not already tracked or pending.
///
/// Channels are usually fifos, and opening a fifo with no live writer
/// blocks until one appears. Each open therefore runs in its own task,
/// tracked in `pending`, so the refresh ticker never stalls on it. A
/// channel whose pid is no longer alive is a leftover from a dead
/// producer and is skipped outright.
async fn scan_channels(
    engine: &Arc<TraceEngine>,
    probe: &Arc<dyn LivenessProbe>,
    pending: &PendingOpens,
    dir: &Path,
    restricted: bool,
) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "cannot scan channel directory");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some((pid, parent_pid)) = name.to_str().and_then(parse_channel_name) else {
            debug!(name = ?name, "ignoring non-channel file");
            continue;
        };

        // Seen on every scan while the channel lives.
        if engine.is_attached(pid) {
            continue;
        }
        if matches!(probe.probe(pid), Liveness::Gone) {
            debug!(pid, "skipping channel left by a dead producer");
            continue;
        }
        if !lock_pending(pending).insert(pid) {
            continue;
        }

        let engine = engine.clone();
        let pending = pending.clone();
        let path = entry.path();
        tokio::spawn(async move {
            match tokio::fs::File::open(&path).await {
                Ok(channel) => match engine.attach(pid, parent_pid, restricted, channel) {
                    Ok(id) => info!(instance = id, pid, parent_pid, "channel attached"),
                    Err(err) => warn!(pid, %err, "attach failed"),
                },
                Err(err) => warn!(pid, %err, "cannot open trace channel"),
            }
            lock_pending(&pending).remove(&pid);
        });
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.log).context("initializing logging")?;

    let probe: Arc<dyn LivenessProbe> = Arc::new(ProcLiveness);
    let engine = Arc::new(TraceEngine::new(config.engine.clone(), probe.clone()));
    let pending = PendingOpens::default();
    let restricted = config.engine.restricted_default;
    let dir = config.collect.channel_dir.clone();

    info!(
        channel_dir = %dir.display(),
        max_memory = config.engine.max_memory_bytes,
        refresh_interval_ms = config.collect.refresh_interval_ms,
        "shelltrace starting"
    );

    if cli.once {
        scan_channels(&engine, &probe, &pending, &dir, restricted).await;
        // Give in-flight opens a moment to land before snapshotting.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while !lock_pending(&pending).is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.refresh().await;
        let snapshot = engine.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.collect.refresh_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scan_channels(&engine, &probe, &pending, &dir, restricted).await;
                let report = engine.refresh().await;
                if !report.is_quiet() {
                    debug!(
                        exited = report.newly_exited.len(),
                        reclaimed = report.reclaimed.len(),
                        "lifecycle changes applied"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let summary = engine.budget_summary();
    info!(
        retained_bytes = summary.retained_bytes,
        dropped_records = summary.dropped_records,
        evicted_records = summary.evicted_records,
        "shelltrace stopping"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
