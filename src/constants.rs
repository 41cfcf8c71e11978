//! Global paths and filenames.

use once_cell::sync::Lazy;
use std::path::PathBuf;

/// ~/.labsensor, or a temp-dir fallback when there is no home directory
pub static SENSOR_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    let mut p = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    p.push(".labsensor");
    p
});

/// ~/.labsensor/logs
pub static LOG_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    let mut p = SENSOR_ROOT.clone();
    p.push("logs");
    p
});

// egress files
pub const EVENT_FILE: &str = "events.jsonl";
// optional config
pub const CONFIG_FILE: &str = "sensor.json";

/// ~/.labsensor/logs/events.jsonl
pub fn default_event_log() -> PathBuf {
    LOG_ROOT.join(EVENT_FILE)
}

/// ~/.labsensor/sensor.json, read by `run` when no --config is given
pub fn default_config() -> PathBuf {
    SENSOR_ROOT.join(CONFIG_FILE)
}

/// Ensure ~/.labsensor and logs/ exist.  Call once during CLI startup.
pub fn ensure_dirs() -> std::io::Result<()> {
    std::fs::create_dir_all(&*LOG_ROOT)?;
    Ok(())
}
