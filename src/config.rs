use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::ring::MAX_CAPACITY;

pub use crate::dedup::DedupConfig;

/// Sensor tuning. Every field has a default so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// ring slots, power of two
    pub ring_capacity: usize,
    /// max records per drain
    pub drain_batch: usize,
    /// collector wait bound; also bounds how long detach goes unnoticed
    pub wait_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// 0 disables periodic stats; change-driven stats are still emitted
    pub stats_interval_ms: u64,
    pub dedup: DedupConfig,
    pub ignored_domains: Vec<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            drain_batch: 256,
            wait_timeout_ms: 100,
            drain_timeout_ms: 5000,
            stats_interval_ms: 1000,
            dedup: DedupConfig::default(),
            ignored_domains: vec!["localhost".to_string()],
        }
    }
}

impl SensorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: SensorConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0
            || !self.ring_capacity.is_power_of_two()
            || self.ring_capacity > MAX_CAPACITY
        {
            bail!(
                "ring_capacity must be a power of two between 1 and {MAX_CAPACITY}, got {}",
                self.ring_capacity
            );
        }
        if self.drain_batch == 0 {
            bail!("drain_batch must be at least 1");
        }
        if self.wait_timeout_ms == 0 {
            bail!("wait_timeout_ms must be at least 1");
        }
        if self.dedup.capacity == 0 {
            bail!("dedup.capacity must be at least 1");
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_ms > 0).then(|| Duration::from_millis(self.stats_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"ring_capacity": 64, "dedup": {{"min_reemit_ms": 250}}}}"#).unwrap();
        let cfg = SensorConfig::load(f.path()).unwrap();
        assert_eq!(cfg.ring_capacity, 64);
        assert_eq!(cfg.dedup.min_reemit_ms, 250);
        assert_eq!(cfg.dedup.capacity, 4096);
        assert_eq!(cfg.drain_batch, 256);
        assert_eq!(cfg.ignored_domains, vec!["localhost".to_string()]);
    }

    #[test]
    fn bad_capacity_is_rejected() {
        let cfg = SensorConfig {
            ring_capacity: 1000,
            ..SensorConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn zero_stats_interval_disables_ticks() {
        let cfg = SensorConfig {
            stats_interval_ms: 0,
            ..SensorConfig::default()
        };
        assert_eq!(cfg.stats_interval(), None);
        assert_eq!(SensorConfig::default().stats_interval(), Some(Duration::from_secs(1)));
    }
}
