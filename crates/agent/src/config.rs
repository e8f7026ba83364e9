use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::spill;

pub const ENV_CONFIG_PATH: &str = "PULSEMON_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pulsemon/agent.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub transmit: TransmitConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: String,
    pub data_dir: String,
    pub labels: HashMap<String, String>,
    pub heartbeat_sec: u64,
    pub metrics_addr: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            data_dir: String::new(),
            labels: HashMap::new(),
            heartbeat_sec: 30,
            metrics_addr: "127.0.0.1:9464".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub mem_items_cap: usize,
    pub spill_to_disk: bool,
    /// Size string with SI/IEC suffixes, e.g. "512MiB" or "2GB".
    pub disk_bytes_cap: String,
    pub spill_threshold_ratio: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mem_items_cap: 4096,
            spill_to_disk: true,
            disk_bytes_cap: String::new(),
            spill_threshold_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    pub batch_size: usize,
    pub idle_sleep_ms: u64,
    pub retry_sleep_ms: u64,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            idle_sleep_ms: 100,
            retry_sleep_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub rate_per_sec: f64,
    pub burst: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 50.0,
            burst: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub workers: usize,
    pub tick_resolution_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick_resolution_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub poll_interval_secs: u64,
    /// Name of the primary binary inside extracted bundles.
    pub binary_name: String,
    /// Explicit install target; empty resolves the current executable.
    pub target_path: String,
    /// Minisign public key used to verify artifact signatures; empty
    /// disables verification.
    pub public_key_path: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            binary_name: "pulsemon-agent".into(),
            target_path: String::new(),
            public_key_path: String::new(),
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("open config {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("parse config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_from_env() -> anyhow::Result<Config> {
    let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load(Path::new(&path))
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.server.trim().is_empty() {
            anyhow::bail!("agent.server is required");
        }
        if self.agent.data_dir.trim().is_empty() {
            anyhow::bail!("agent.data_dir is required");
        }
        if self.queue.mem_items_cap == 0 {
            anyhow::bail!("queue.mem_items_cap must be > 0");
        }
        parse_size(&self.queue.disk_bytes_cap, spill::DEFAULT_MAX_BYTES)
            .context("queue.disk_bytes_cap")?;
        Ok(())
    }

    pub fn disk_bytes_cap(&self) -> u64 {
        parse_size(&self.queue.disk_bytes_cap, spill::DEFAULT_MAX_BYTES)
            .unwrap_or(spill::DEFAULT_MAX_BYTES)
    }
}

const SIZE_UNITS: &[(&str, u64)] = &[
    ("tib", 1024 * 1024 * 1024 * 1024),
    ("tb", 1000 * 1000 * 1000 * 1000),
    ("gib", 1024 * 1024 * 1024),
    ("gb", 1000 * 1000 * 1000),
    ("mib", 1024 * 1024),
    ("mb", 1000 * 1000),
    ("kib", 1024),
    ("kb", 1000),
    ("b", 1),
];

/// Parses a human size string ("512MiB", "2GB", "1048576"); empty input
/// yields the default. Suffixes are matched longest-first so "MiB" is
/// not read as "B".
pub fn parse_size(value: &str, default_bytes: u64) -> anyhow::Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(default_bytes);
    }
    let lower = value.to_ascii_lowercase();
    for (suffix, multiplier) in SIZE_UNITS {
        if let Some(prefix) = lower.strip_suffix(suffix) {
            let number: f64 = prefix
                .trim()
                .parse()
                .with_context(|| format!("parse size {value:?}"))?;
            if number < 0.0 {
                anyhow::bail!("parse size {value:?}: negative");
            }
            return Ok((number * *multiplier as f64) as u64);
        }
    }
    value
        .parse::<u64>()
        .with_context(|| format!("parse size {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_handles_iec_and_si_suffixes() {
        assert_eq!(parse_size("512MiB", 0).unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2GB", 0).unwrap(), 2_000_000_000);
        assert_eq!(parse_size("1.5kib", 0).unwrap(), 1536);
        assert_eq!(parse_size("100b", 0).unwrap(), 100);
        assert_eq!(parse_size("1048576", 0).unwrap(), 1_048_576);
    }

    #[test]
    fn parse_size_defaults_on_empty() {
        assert_eq!(parse_size("", 42).unwrap(), 42);
        assert_eq!(parse_size("   ", 42).unwrap(), 42);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("lots", 0).is_err());
        assert!(parse_size("-5mb", 0).is_err());
    }

    #[test]
    fn config_parses_minimal_yaml() {
        let raw = r#"
agent:
  server: https://controller.example
  data_dir: /var/lib/pulsemon
queue:
  mem_items_cap: 1024
  spill_to_disk: true
  disk_bytes_cap: 256MiB
run:
  workers: 8
upgrade:
  poll_interval_secs: 30
"#;
        let cfg: Config = serde_yaml::from_str(raw).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.queue.mem_items_cap, 1024);
        assert_eq!(cfg.disk_bytes_cap(), 256 * 1024 * 1024);
        assert_eq!(cfg.run.workers, 8);
        assert_eq!(cfg.upgrade.poll_interval_secs, 30);
        assert_eq!(cfg.transmit.batch_size, 256);
    }

    #[test]
    fn config_requires_server_and_data_dir() {
        let cfg: Config = serde_yaml::from_str("agent:\n  server: ''\n").expect("parse");
        assert!(cfg.validate().is_err());
    }
}
