use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "labsensor",
    version = env!("CARGO_PKG_VERSION"),
    about = "Ring-buffered telemetry sensor for malware lab runs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Attach the sensor to a replayed notification stream, then detach
    Run {
        /// JSONL file of native notifications to deliver
        #[arg(long)]
        replay: PathBuf,
        /// sensor config (JSON), defaults to ~/.labsensor/sensor.json if present
        #[arg(long)]
        config: Option<PathBuf>,
        /// ring slots, power of two; overrides the config file
        #[arg(long)]
        ring_capacity: Option<usize>,
        /// egress log path, defaults to ~/.labsensor/logs/events.jsonl or $LABSENSOR_LOG
        #[arg(long, env = "LABSENSOR_LOG")]
        log: Option<PathBuf>,
        /// also write length-prefixed binary frames here
        #[arg(long)]
        frames: Option<PathBuf>,
        /// delay between replayed notifications
        #[arg(long, default_value_t = 0)]
        pace_ms: u64,
        #[arg(short, long)]
        verbose: bool,
    },

    /// Verify integrity of an existing egress log
    Verify {
        /// log file path, defaults to ~/.labsensor/logs/events.jsonl or $LABSENSOR_LOG
        #[arg(long, env = "LABSENSOR_LOG")]
        log: Option<PathBuf>,
    },

    /// Print a binary frame stream as JSON lines
    Decode {
        frames: PathBuf,
        /// show per-frame decode failures
        #[arg(short, long)]
        verbose: bool,
    },
}
