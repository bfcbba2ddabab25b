// SPDX-License-Identifier: GPL-2.0

//! Service configuration.
//!
//! Defaults, then an optional flat TOML file, then environment overrides
//! with the `PVE_AFFINITY_` prefix. Measurement rounds and iterations
//! default adaptively from the present processor count so the initial
//! ranking stays bounded on large hosts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::topology::present_cpu_count;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pve-affinity.toml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/pve-affinity/pve-affinity.sock";
pub const DEFAULT_LOG_FILE: &str = "/var/log/pve-affinity.log";

/// Directory holding `<vmid>.pid` files written by the hypervisor.
pub const QEMU_PID_DIR: &str = "/var/run/qemu-server";

/// Debounce window for grouping processor hotplug events.
pub const HOTPLUG_BATCH_WINDOW: Duration = Duration::from_secs(5);

/// Wall-clock cap on one full ranking calculation.
pub const MAX_RANKING_DURATION: Duration = Duration::from_secs(120);

const ENV_PREFIX: &str = "PVE_AFFINITY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    pub log_level: String,
    /// Full measurement passes to average.
    pub rounds: u32,
    /// Ping-pongs per pair measurement.
    pub iterations: u32,
    /// Connect retries for hook and CLI clients.
    pub socket_retry: u32,
    /// Sleep between connect retries, seconds.
    pub socket_sleep_secs: u64,
    /// End-to-end deadline for one socket exchange, seconds.
    pub socket_timeout_secs: u64,
    pub hotplug_watchdog: bool,
    pub ping_on_pre_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        let (rounds, iterations) = adaptive_measurement_parameters(present_cpu_count());
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_level: "info".into(),
            rounds,
            iterations,
            socket_retry: 10,
            socket_sleep_secs: 10,
            socket_timeout_secs: 5,
            hotplug_watchdog: true,
            ping_on_pre_start: true,
        }
    }
}

impl Config {
    /// Load configuration: defaults, the TOML file at `path` when present,
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut cfg = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path:?}"))?;
            Self::from_toml(&content).with_context(|| format!("parsing config file {path:?}"))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn socket_sleep(&self) -> Duration {
        Duration::from_secs(self.socket_sleep_secs)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("SOCKET") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOG_FILE") {
            self.log_file = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = env_parse::<u32>("ROUNDS") {
            self.rounds = v;
        }
        if let Some(v) = env_parse::<u32>("ITERATIONS") {
            self.iterations = v;
        }
        if let Some(v) = env_parse::<u32>("SOCKET_RETRY") {
            self.socket_retry = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_SLEEP") {
            self.socket_sleep_secs = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_TIMEOUT") {
            self.socket_timeout_secs = v;
        }
        if let Some(v) = env_bool("HOTPLUG_WATCHDOG") {
            self.hotplug_watchdog = v;
        }
        if let Some(v) = env_bool("PING_ON_PRE_START") {
            self.ping_on_pre_start = v;
        }
    }
}

/// Measurement parameters scaled down with processor count. A full sweep is
/// quadratic in the number of processors, so large hosts trade precision
/// for a bounded startup time.
pub fn adaptive_measurement_parameters(cpu_count: usize) -> (u32, u32) {
    match cpu_count {
        0..=16 => (10, 100_000),
        17..=32 => (5, 50_000),
        33..=64 => (3, 25_000),
        65..=128 => (2, 10_000),
        _ => (2, 5_000),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    match env_var(name)?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_parameters_scale_with_cpu_count() {
        assert_eq!(adaptive_measurement_parameters(4), (10, 100_000));
        assert_eq!(adaptive_measurement_parameters(16), (10, 100_000));
        assert_eq!(adaptive_measurement_parameters(17), (5, 50_000));
        assert_eq!(adaptive_measurement_parameters(32), (5, 50_000));
        assert_eq!(adaptive_measurement_parameters(64), (3, 25_000));
        assert_eq!(adaptive_measurement_parameters(128), (2, 10_000));
        assert_eq!(adaptive_measurement_parameters(256), (2, 5_000));
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = Config::from_toml(
            r#"
socket_path = "/tmp/test.sock"
rounds = 3
hotplug_watchdog = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(cfg.rounds, 3);
        assert!(!cfg.hotplug_watchdog);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.socket_timeout_secs, 5);
        assert!(cfg.ping_on_pre_start);
    }

    #[test]
    fn bad_toml_is_rejected() {
        assert!(Config::from_toml("rounds = \"many\"").is_err());
    }

    #[test]
    fn env_overrides_win() {
        std::env::set_var("PVE_AFFINITY_ROUNDS", "7");
        std::env::set_var("PVE_AFFINITY_HOTPLUG_WATCHDOG", "off");
        std::env::set_var("PVE_AFFINITY_SOCKET", "/tmp/env.sock");

        let mut cfg = Config::default();
        cfg.apply_env_overrides();

        std::env::remove_var("PVE_AFFINITY_ROUNDS");
        std::env::remove_var("PVE_AFFINITY_HOTPLUG_WATCHDOG");
        std::env::remove_var("PVE_AFFINITY_SOCKET");

        assert_eq!(cfg.rounds, 7);
        assert!(!cfg.hotplug_watchdog);
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/env.sock"));
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let cfg = Config {
            socket_timeout_secs: 3,
            socket_sleep_secs: 2,
            ..Config::default()
        };
        assert_eq!(cfg.socket_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.socket_sleep(), Duration::from_secs(2));
    }
}
