// SPDX-License-Identifier: GPL-2.0

//! Guest placement: selection application.
//!
//! Takes the cpu set picked by the ranking engine for a starting guest and
//! applies it as an affinity mask to every task belonging to the guest's
//! root process: its threads, the children of those threads, and the
//! children's threads. Selection happens under the engine lock; everything
//! that touches `/proc` or the kernel runs after the selection is frozen,
//! so a concurrent ranking rebuild never blocks on kernel calls. A rebuild
//! racing the application can at worst leave a suboptimal placement, which
//! the next guest restart corrects.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use serde::Serialize;

use crate::error::Error;
use crate::pve::GuestInspector;
use crate::ranking::RankingEngine;

/// Task enumeration and affinity application. Swappable in tests.
pub trait ProcFs: Send + Sync {
    /// Task ids of all threads of `pid`.
    fn process_threads(&self, pid: i32) -> std::io::Result<Vec<i32>>;
    /// Pids listed as children of thread `tid` of process `pid`.
    fn thread_children(&self, pid: i32, tid: i32) -> std::io::Result<Vec<i32>>;
    /// Bind task `tid` to the given processors.
    fn set_affinity(&self, tid: i32, cpus: &[u32]) -> std::io::Result<()>;
}

/// The real thing, backed by `/proc` and `sched_setaffinity`.
pub struct SystemProcFs {
    proc_root: PathBuf,
}

impl Default for SystemProcFs {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl SystemProcFs {
    pub fn with_root<P: AsRef<Path>>(proc_root: P) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }
}

impl ProcFs for SystemProcFs {
    fn process_threads(&self, pid: i32) -> std::io::Result<Vec<i32>> {
        let dir = self.proc_root.join(format!("{pid}/task"));
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
                tids.push(tid);
            }
        }
        Ok(tids)
    }

    fn thread_children(&self, pid: i32, tid: i32) -> std::io::Result<Vec<i32>> {
        let path = self.proc_root.join(format!("{pid}/task/{tid}/children"));
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .split_ascii_whitespace()
            .filter_map(|f| f.parse::<i32>().ok())
            .collect())
    }

    fn set_affinity(&self, tid: i32, cpus: &[u32]) -> std::io::Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu as usize, &mut set);
            }
            if libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Result of one placement operation, in the wire shape the hook expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementOutcome {
    pub action: String,
}

impl PlacementOutcome {
    fn applied(csv: &str) -> Self {
        Self {
            action: format!("new affinity: {csv}"),
        }
    }

    fn already_configured(affinity: &str) -> Self {
        Self {
            action: format!("vm has an affinity configuration {affinity}"),
        }
    }
}

pub struct PlacementScheduler {
    engine: Arc<RankingEngine>,
    pve: Box<dyn GuestInspector>,
    procfs: Box<dyn ProcFs>,
}

impl PlacementScheduler {
    pub fn new(engine: Arc<RankingEngine>, pve: Box<dyn GuestInspector>) -> Self {
        Self::with_procfs(engine, pve, Box::new(SystemProcFs::default()))
    }

    pub fn with_procfs(
        engine: Arc<RankingEngine>,
        pve: Box<dyn GuestInspector>,
        procfs: Box<dyn ProcFs>,
    ) -> Self {
        Self {
            engine,
            pve,
            procfs,
        }
    }

    /// Place a freshly started guest.
    ///
    /// Reads the guest's configured processor count, selects that many
    /// neighbor-contiguous cpus from the ranking, and binds every task of
    /// the guest's process tree to them. Guests with an operator-set
    /// affinity are left alone.
    pub fn apply_placement(&self, vmid: u32) -> Result<PlacementOutcome> {
        info!("placement requested for guest {vmid}");

        let config = self.pve.guest_config(vmid)?;
        let pid = self
            .pve
            .guest_pid(vmid)?
            .ok_or(Error::NotRunning(vmid))?;

        if config.hookscript.is_empty() {
            warn!("guest {vmid} has no hookscript configured");
        }
        if !config.affinity.is_empty() {
            info!(
                "guest {vmid} already has an affinity configuration: {}",
                config.affinity
            );
            return Ok(PlacementOutcome::already_configured(&config.affinity));
        }

        let count = (config.sockets * config.cores) as usize;
        let cpus = self.engine.select_cpus(vmid, count)?;
        let csv = cpus
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        info!("applying affinity {csv} to guest {vmid}, root pid {pid}");

        // The selection is frozen; everything below runs without the lock.
        let tasks = self.collect_tasks(pid);
        for &tid in &tasks {
            if let Err(e) = self.procfs.set_affinity(tid, &cpus) {
                warn!("failed to set affinity of task {tid} for guest {vmid}: {e}");
            }
        }

        info!(
            "affinity {csv} applied to guest {vmid}, {} tasks updated",
            tasks.len()
        );
        Ok(PlacementOutcome::applied(&csv))
    }

    /// All task ids of the guest's process tree: threads of the root,
    /// children of those threads, and the children's threads. Keyed by task
    /// id so nothing is touched twice.
    fn collect_tasks(&self, pid: i32) -> Vec<i32> {
        let mut tasks = BTreeSet::new();

        let root_threads = match self.procfs.process_threads(pid) {
            Ok(tids) => tids,
            Err(e) => {
                warn!("failed to enumerate threads of pid {pid}, using root pid only: {e}");
                tasks.insert(pid);
                return tasks.into_iter().collect();
            }
        };
        tasks.extend(root_threads.iter().copied());

        for &tid in &root_threads {
            let children = match self.procfs.thread_children(pid, tid) {
                Ok(v) => v,
                Err(_) => continue,
            };
            for child in children {
                tasks.insert(child);
                if let Ok(child_threads) = self.procfs.process_threads(child) {
                    tasks.extend(child_threads);
                }
            }
        }

        tasks.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::LinkMeasurer;
    use crate::pve::GuestConfig;
    use crate::topology::{CpuTopology, TopologyProbe};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedProbe(Vec<CpuTopology>);

    impl TopologyProbe for FixedProbe {
        fn detect(&self) -> crate::error::Result<Vec<CpuTopology>> {
            Ok(self.0.clone())
        }
    }

    struct DistanceMeasurer;

    impl LinkMeasurer for DistanceMeasurer {
        fn measure(&self, a: u32, b: u32, _: u32) -> crate::error::Result<f64> {
            Ok(f64::from(a.abs_diff(b)) * 10.0)
        }
    }

    fn ready_engine(cpus: u32) -> Arc<RankingEngine> {
        let topology = (0..cpus)
            .map(|cpu| CpuTopology {
                cpu,
                socket: 0,
                core: cpu as i32,
            })
            .collect();
        let engine = Arc::new(RankingEngine::with_parts(
            Box::new(FixedProbe(topology)),
            Box::new(DistanceMeasurer),
        ));
        engine.update(1, 1, |_, _| {}).unwrap();
        engine
    }

    struct MockInspector {
        config: GuestConfig,
        pid: Option<i32>,
    }

    impl GuestInspector for MockInspector {
        fn guest_config(&self, _vmid: u32) -> Result<GuestConfig> {
            Ok(self.config.clone())
        }

        fn guest_pid(&self, _vmid: u32) -> Result<Option<i32>> {
            Ok(self.pid)
        }
    }

    #[derive(Default)]
    struct MockProcFs {
        threads: HashMap<i32, Vec<i32>>,
        children: HashMap<(i32, i32), Vec<i32>>,
        fail_affinity_for: Vec<i32>,
        applied: Mutex<Vec<(i32, Vec<u32>)>>,
    }

    impl ProcFs for MockProcFs {
        fn process_threads(&self, pid: i32) -> std::io::Result<Vec<i32>> {
            self.threads
                .get(&pid)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }

        fn thread_children(&self, pid: i32, tid: i32) -> std::io::Result<Vec<i32>> {
            Ok(self.children.get(&(pid, tid)).cloned().unwrap_or_default())
        }

        fn set_affinity(&self, tid: i32, cpus: &[u32]) -> std::io::Result<()> {
            self.applied.lock().unwrap().push((tid, cpus.to_vec()));
            if self.fail_affinity_for.contains(&tid) {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
            }
            Ok(())
        }
    }

    fn inspector(sockets: u32, cores: u32, pid: Option<i32>) -> Box<MockInspector> {
        Box::new(MockInspector {
            config: GuestConfig {
                sockets,
                cores,
                affinity: String::new(),
                hookscript: "local:snippets/hook.sh".into(),
            },
            pid,
        })
    }

    #[test]
    fn applies_mask_to_whole_process_tree() {
        let procfs = MockProcFs {
            threads: HashMap::from([
                (1000, vec![1000, 1001]),
                (2000, vec![2000, 2001]),
            ]),
            children: HashMap::from([((1000, 1000), vec![2000])]),
            ..Default::default()
        };
        let applied_log = Arc::new(procfs);

        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            inspector(1, 2, Some(1000)),
            Box::new(MockProcFsProxy(applied_log.clone())),
        );

        let outcome = sched.apply_placement(100).unwrap();
        assert!(outcome.action.starts_with("new affinity: "));

        let applied = applied_log.applied.lock().unwrap();
        let tids: BTreeSet<i32> = applied.iter().map(|(tid, _)| *tid).collect();
        assert_eq!(tids, BTreeSet::from([1000, 1001, 2000, 2001]));
        // Every task gets the same two-cpu mask.
        assert!(applied.iter().all(|(_, cpus)| cpus.len() == 2));
    }

    /// Trait-object indirection so the test can keep a handle on the mock
    /// after handing it to the scheduler.
    struct MockProcFsProxy(Arc<MockProcFs>);

    impl ProcFs for MockProcFsProxy {
        fn process_threads(&self, pid: i32) -> std::io::Result<Vec<i32>> {
            self.0.process_threads(pid)
        }
        fn thread_children(&self, pid: i32, tid: i32) -> std::io::Result<Vec<i32>> {
            self.0.thread_children(pid, tid)
        }
        fn set_affinity(&self, tid: i32, cpus: &[u32]) -> std::io::Result<()> {
            self.0.set_affinity(tid, cpus)
        }
    }

    #[test]
    fn existing_affinity_is_left_alone() {
        let mock = Arc::new(MockProcFs::default());
        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            Box::new(MockInspector {
                config: GuestConfig {
                    sockets: 1,
                    cores: 2,
                    affinity: "0-3".into(),
                    hookscript: String::new(),
                },
                pid: Some(1000),
            }),
            Box::new(MockProcFsProxy(mock.clone())),
        );

        let outcome = sched.apply_placement(100).unwrap();
        assert_eq!(outcome.action, "vm has an affinity configuration 0-3");
        assert!(mock.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn stopped_guest_is_an_error() {
        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            inspector(1, 2, None),
            Box::new(MockProcFs::default()),
        );
        let err = sched.apply_placement(100).unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn falls_back_to_root_pid_when_thread_enumeration_fails() {
        let mock = Arc::new(MockProcFs::default()); // no thread table at all
        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            inspector(1, 1, Some(1000)),
            Box::new(MockProcFsProxy(mock.clone())),
        );

        sched.apply_placement(100).unwrap();
        let applied = mock.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, 1000);
    }

    #[test]
    fn per_task_affinity_failure_does_not_abort() {
        let mock = Arc::new(MockProcFs {
            threads: HashMap::from([(1000, vec![1000, 1001, 1002])]),
            fail_affinity_for: vec![1001],
            ..Default::default()
        });
        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            inspector(1, 1, Some(1000)),
            Box::new(MockProcFsProxy(mock.clone())),
        );

        let outcome = sched.apply_placement(100).unwrap();
        assert!(outcome.action.starts_with("new affinity: "));
        // All three tasks were attempted despite the failure in the middle.
        assert_eq!(mock.applied.lock().unwrap().len(), 3);
    }

    #[test]
    fn oversized_guest_is_rejected() {
        let sched = PlacementScheduler::with_procfs(
            ready_engine(3),
            inspector(2, 2, Some(1000)),
            Box::new(MockProcFs::default()),
        );
        let err = sched.apply_placement(100).unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn repeated_placement_is_sticky() {
        let mock = Arc::new(MockProcFs {
            threads: HashMap::from([(1000, vec![1000])]),
            ..Default::default()
        });
        let sched = PlacementScheduler::with_procfs(
            ready_engine(4),
            inspector(1, 2, Some(1000)),
            Box::new(MockProcFsProxy(mock.clone())),
        );

        let first = sched.apply_placement(100).unwrap();
        let second = sched.apply_placement(100).unwrap();
        assert_eq!(first, second);
    }
}
