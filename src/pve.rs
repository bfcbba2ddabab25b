// SPDX-License-Identifier: GPL-2.0

//! Hypervisor collaborator.
//!
//! The placement scheduler needs two facts about a guest: its configured
//! processor count (and any operator-set affinity), and the pid of its root
//! process. Both come from the Proxmox side of the host: `pvesh` for the
//! config, the qemu-server pid files for the pid.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Deserialize;

use crate::config::QEMU_PID_DIR;

/// Guest facts needed for placement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GuestConfig {
    #[serde(default = "default_one")]
    pub sockets: u32,
    #[serde(default = "default_one")]
    pub cores: u32,
    #[serde(default)]
    pub affinity: String,
    #[serde(default)]
    pub hookscript: String,
}

fn default_one() -> u32 {
    1
}

/// Runs an external command and captures its stdout. Swappable in tests.
pub trait Executor: Send + Sync {
    fn output(&self, program: &str, args: &[&str]) -> std::io::Result<Vec<u8>>;
}

struct SystemExecutor;

impl Executor for SystemExecutor {
    fn output(&self, program: &str, args: &[&str]) -> std::io::Result<Vec<u8>> {
        let out = Command::new(program).args(args).output()?;
        if !out.status.success() {
            return Err(std::io::Error::other(format!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out.stdout)
    }
}

/// Source of per-guest facts.
pub trait GuestInspector: Send + Sync {
    fn guest_config(&self, vmid: u32) -> Result<GuestConfig>;
    /// Root pid of the running guest, `None` when it is not running.
    fn guest_pid(&self, vmid: u32) -> Result<Option<i32>>;
}

pub struct PveClient {
    node: String,
    pid_dir: PathBuf,
    executor: Box<dyn Executor>,
}

impl PveClient {
    pub fn new() -> Result<Self> {
        let hostname = nix::unistd::gethostname().context("failed to get hostname")?;
        let hostname = hostname.to_string_lossy();
        // Proxmox node names are the short hostname.
        let node = hostname.split('.').next().unwrap_or(&hostname).to_string();
        Ok(Self::with_parts(node, QEMU_PID_DIR, Box::new(SystemExecutor)))
    }

    pub fn with_parts<P: AsRef<Path>>(
        node: String,
        pid_dir: P,
        executor: Box<dyn Executor>,
    ) -> Self {
        Self {
            node,
            pid_dir: pid_dir.as_ref().to_path_buf(),
            executor,
        }
    }
}

impl GuestInspector for PveClient {
    fn guest_config(&self, vmid: u32) -> Result<GuestConfig> {
        let path = format!("/nodes/{}/qemu/{vmid}/config", self.node);
        let output = self
            .executor
            .output(
                "/usr/bin/pvesh",
                &["get", &path, "--output-format", "json"],
            )
            .with_context(|| format!("pvesh query for guest {vmid} failed"))?;

        let config: GuestConfig = serde_json::from_slice(&output)
            .with_context(|| format!("failed to parse config of guest {vmid}"))?;
        debug!("guest {vmid} config: {config:?}");
        Ok(config)
    }

    fn guest_pid(&self, vmid: u32) -> Result<Option<i32>> {
        let path = self.pid_dir.join(format!("{vmid}.pid"));
        let content = match std::fs::read_to_string(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {path:?}")),
        };

        let pid: i32 = content
            .trim()
            .parse()
            .with_context(|| format!("failed to parse pid from {path:?}"))?;
        if pid <= 0 {
            bail!("nonsensical pid {pid} in {path:?}");
        }

        // Zero-signal probe: delivery is not attempted, only liveness and
        // permission checks run.
        if kill(Pid::from_raw(pid), None).is_err() {
            return Ok(None);
        }
        Ok(Some(pid))
    }
}
