// SPDX-License-Identifier: GPL-2.0

//! Processor topology discovery.
//!
//! Enumerates the present logical processors from the kernel's sysfs
//! topology surface. A processor whose `physical_package_id` cannot be read
//! is treated as offline and skipped; a missing `core_id` degrades to the
//! unknown sentinel. The probe is read-only and idempotent; the ranking
//! engine re-runs it on every rebuild, so hotplugged processors show up on
//! the next sweep.

use std::path::{Path, PathBuf};

use glob::glob;
use serde::{Deserialize, Serialize};
use sscanf::sscanf;

use crate::error::{Error, Result};

/// Sentinel for a processor whose physical core id is not exposed.
pub const CORE_UNKNOWN: i32 = -1;

/// One logical processor, in the kernel's own terms.
///
/// - `cpu`: the logical processor id, as used by `sched_setaffinity` and
///   `taskset -c`.
/// - `socket`: the physical package id.
/// - `core`: the physical core id within the socket, [`CORE_UNKNOWN`] when
///   the kernel does not report one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub cpu: u32,
    pub socket: u32,
    pub core: i32,
}

/// Something that produces the current processor topology.
pub trait TopologyProbe: Send + Sync {
    fn detect(&self) -> Result<Vec<CpuTopology>>;
}

/// The real probe, backed by `/sys/devices/system/cpu`.
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::with_root("/")
    }
}

impl SysfsTopology {
    /// A probe rooted somewhere other than `/`. Used by tests with a fake
    /// sysfs tree.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join("sys/devices/system/cpu")
    }
}

impl TopologyProbe for SysfsTopology {
    fn detect(&self) -> Result<Vec<CpuTopology>> {
        let pattern = self.cpu_dir().join("cpu[0-9]*");
        let paths = glob(&pattern.to_string_lossy())
            .map_err(|e| Error::Topology(format!("bad sysfs glob {pattern:?}: {e}")))?;

        let mut cpus = Vec::new();
        for entry in paths.filter_map(std::result::Result::ok) {
            let name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(v) => v,
                None => continue,
            };
            let id = match sscanf!(name, "cpu{u32}") {
                Some(v) => v,
                None => continue,
            };

            // A processor without a readable physical_package_id is offline.
            let socket = match read_sysfs_u32(&entry.join("topology/physical_package_id")) {
                Ok(v) => v,
                Err(_) => continue,
            };

            let core = read_sysfs_u32(&entry.join("topology/core_id"))
                .map(|v| v as i32)
                .unwrap_or(CORE_UNKNOWN);

            cpus.push(CpuTopology {
                cpu: id,
                socket,
                core,
            });
        }

        cpus.sort_by_key(|c| c.cpu);
        Ok(cpus)
    }
}

/// Number of present processors according to sysfs, regardless of this
/// process's own affinity mask. Falls back to the scheduler's view when the
/// sysfs tree is unavailable.
pub fn present_cpu_count() -> usize {
    let pattern = "/sys/devices/system/cpu/cpu[0-9]*";
    match glob(pattern) {
        Ok(paths) => {
            let n = paths.filter_map(std::result::Result::ok).count();
            if n > 0 {
                return n;
            }
            available_parallelism_fallback()
        }
        Err(_) => available_parallelism_fallback(),
    }
}

fn available_parallelism_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn read_sysfs_u32(path: &Path) -> Result<u32> {
    let val = std::fs::read_to_string(path)?;
    val.trim()
        .parse::<u32>()
        .map_err(|e| Error::Topology(format!("failed to parse {path:?}: {e}")))
}
