// src/main.rs
mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use labsensor::io::{self, EgressTargets, SessionHeader};
use labsensor::replay::ReplayHost;
use labsensor::{constants, log, Sensor, SensorConfig};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collector → egress queue depth.
const EGRESS_QUEUE: usize = 1024;

struct RunArgs {
    replay: PathBuf,
    config: Option<PathBuf>,
    ring_capacity: Option<usize>,
    log: Option<PathBuf>,
    frames: Option<PathBuf>,
    pace_ms: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.cmd {
        // ──────────────────────────── run ─────────────────────────────────
        Commands::Run {
            replay,
            config,
            ring_capacity,
            log: log_path,
            frames,
            pace_ms,
            verbose,
        } => {
            log::init(verbose);
            let args = RunArgs {
                replay,
                config,
                ring_capacity,
                log: log_path,
                frames,
                pace_ms,
            };
            if let Err(e) = run(args).await {
                eprintln!("labsensor: {e:#}");
                exit(1);
            }
        }

        // ─────────────────────────── verify ────────────────────────────────
        Commands::Verify { log: log_path } => {
            let path = log_path.unwrap_or_else(constants::default_event_log);
            match io::verify_chain(&path) {
                Ok(lines) => println!("✔ log ok ({lines} lines)"),
                Err(e) => {
                    eprintln!("✘ {e:#}");
                    std::io::stderr().flush().ok();
                    exit(1);
                }
            }
        }

        // ─────────────────────────── decode ────────────────────────────────
        Commands::Decode { frames, verbose } => {
            log::init(verbose);
            if let Err(e) = decode(&frames) {
                eprintln!("labsensor: {e:#}");
                exit(1);
            }
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let fallback = constants::default_config();
    let mut cfg = match &args.config {
        Some(path) => SensorConfig::load(path)?,
        None if fallback.is_file() => {
            info!(path = %fallback.display(), "using default config");
            SensorConfig::load(&fallback)?
        }
        None => SensorConfig::default(),
    };
    if let Some(cap) = args.ring_capacity {
        cfg.ring_capacity = cap;
    }
    cfg.validate()?;

    let log_path = match args.log {
        Some(p) => p,
        None => {
            constants::ensure_dirs().context("creating ~/.labsensor")?;
            constants::default_event_log()
        }
    };

    let host = Arc::new(
        ReplayHost::from_path(&args.replay)?.with_pacing(Duration::from_millis(args.pace_ms)),
    );

    let (tx, rx) = mpsc::channel(EGRESS_QUEUE);
    let egress = tokio::spawn(io::run_egress(
        rx,
        EgressTargets {
            log: log_path.clone(),
            frames: args.frames.clone(),
        },
        SessionHeader::new(),
    ));

    let interrupted = CancellationToken::new();
    {
        let token = interrupted.clone();
        ctrlc::set_handler(move || token.cancel()).context("installing Ctrl-C handler")?;
    }

    let sensor = Sensor::attach(&cfg, host.clone(), tx).await?;
    let detach_requested = sensor.detach_requested();

    tokio::select! {
        _ = host.wait_until_finished() => debug!(delivered = host.delivered(), "replay finished"),
        _ = interrupted.cancelled() => info!("interrupted; detaching"),
        _ = detach_requested.cancelled() => warn!("collector requested detach"),
    }

    let report = sensor.detach(cfg.drain_timeout()).await?;
    let summary = egress.await.context("egress task panicked")??;

    let s = report.stats;
    println!(
        "✔ {} events, {} stats records → {}",
        summary.events,
        summary.stats,
        log_path.display()
    );
    if let Some(frames) = &args.frames {
        println!("  {} frames → {}", summary.frames, frames.display());
    }
    println!(
        "  published {} · dropped {} · gaps {} · suppressed {} · decode errors {} · rejected {}",
        s.adapters.published,
        s.dropped_total,
        s.gaps,
        s.suppressed,
        s.decode_errors,
        s.adapters.rejected
    );
    if report.is_fatal() {
        warn!(exit = ?report.exit, "collector ended on a fatal error");
    }
    Ok(())
}

fn decode(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open frames {:?}", path))?;
    let readout = io::read_frames(BufReader::new(file))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for rec in &readout.records {
        writeln!(out, "{}", serde_json::to_string(rec)?)?;
    }
    out.flush()?;
    if readout.errors > 0 {
        eprintln!("skipped {} bad frames", readout.errors);
    }
    Ok(())
}
