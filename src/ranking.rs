// SPDX-License-Identifier: GPL-2.0

//! Core-to-core latency ranking.
//!
//! The engine drives the topology probe and the link measurer over every
//! ordered pair of present processors for a configured number of rounds,
//! averages the results, and keeps a per-source neighbor list sorted by
//! ascending latency. The ranking cache, the rotation cursor and the
//! per-guest selections live behind one `RwLock`: many concurrent readers,
//! a single writer, and no kernel calls under the lock.
//!
//! Direction matters. `lat(i→j)` and `lat(j→i)` are measured and kept as
//! distinct edges; a source's neighbor list orders by the outgoing
//! direction only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::latency::{LinkMeasurer, PingPongMeasurer};
use crate::topology::{SysfsTopology, TopologyProbe};

/// A target processor and the measured cost of reaching it from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub cpu: u32,
    pub socket: u32,
    pub core: i32,
    pub latency_ns: f64,
    pub std_dev: f64,
}

/// A source processor and its neighbors, nearest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreRanking {
    pub cpu: u32,
    pub ranking: Vec<Neighbor>,
}

/// Aggregate statistics over a ranking, recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingSummary {
    pub cpu_count: usize,
    pub socket_count: usize,
    pub min_latency_ns: f64,
    pub max_latency_ns: f64,
    pub median_latency_ns: f64,
    pub mean_latency_ns: f64,
}

#[derive(Default)]
struct EngineState {
    cache: Vec<CoreRanking>,
    /// Rotation cursor: index of the last source handed out, wrapping.
    cursor: usize,
    /// Sticky per-guest selections, cleared on every cache rebuild.
    selections: BTreeMap<u32, Vec<u32>>,
}

/// Owner of the ranking cache and the placement selection state.
pub struct RankingEngine {
    state: RwLock<EngineState>,
    probe: Box<dyn TopologyProbe>,
    measurer: Box<dyn LinkMeasurer>,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RankingEngine {
    pub fn new() -> Self {
        Self::with_parts(
            Box::new(SysfsTopology::default()),
            Box::new(PingPongMeasurer),
        )
    }

    /// Engine with injected probe and measurer. Tests use this to run the
    /// full update path without touching real hardware.
    pub fn with_parts(probe: Box<dyn TopologyProbe>, measurer: Box<dyn LinkMeasurer>) -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            probe,
            measurer,
        }
    }

    /// Run the full measurement sweep and replace the cache atomically.
    ///
    /// `progress` is invoked once per round with `(current, total)`. Any
    /// probe or measurement failure aborts the sweep; partial results are
    /// discarded and the previous cache stays in place.
    pub fn update(
        &self,
        rounds: u32,
        iterations: u32,
        progress: impl FnMut(u32, u32),
    ) -> Result<()> {
        let rankings = self.sweep(rounds, iterations, None, progress)?;
        self.install(rankings);
        Ok(())
    }

    /// Like [`update`](Self::update) but bounded by a wall-clock cap.
    /// Exceeding the cap returns [`Error::Timeout`] and leaves the cache
    /// unchanged. Logs the resulting summary.
    pub fn calculate_ranking(&self, rounds: u32, iterations: u32, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        info!("calculating core-to-core ranking, rounds={rounds} iterations={iterations}");

        let rankings = self.sweep(rounds, iterations, Some(timeout), |round, total| {
            debug!("ranking calculation progress, round {round}/{total}");
        })?;

        let summary = summarize(&rankings);
        self.install(rankings);

        let summary_json =
            serde_json::to_string(&summary).unwrap_or_else(|_| "<unserializable>".into());
        info!(
            "cpu topology ranking calculated in {:?}, summary {summary_json}",
            start.elapsed()
        );
        Ok(())
    }

    /// Snapshot of the current ranking cache.
    pub fn get_ranking(&self) -> Result<Vec<CoreRanking>> {
        let state = self.state.read().unwrap();
        if state.cache.is_empty() {
            return Err(Error::NotReady);
        }
        Ok(state.cache.clone())
    }

    /// Snapshot of the per-guest cpu selections.
    pub fn guest_selections(&self) -> BTreeMap<u32, Vec<u32>> {
        self.state.read().unwrap().selections.clone()
    }

    /// Pick `count` neighbor-contiguous cpus for a guest.
    ///
    /// A guest that asks again for the same count before the next cache
    /// rebuild gets its previous selection back. New selections advance the
    /// rotation cursor first, then take that source plus its `count - 1`
    /// nearest neighbors.
    pub fn select_cpus(&self, vmid: u32, count: usize) -> Result<Vec<u32>> {
        let mut state = self.state.write().unwrap();

        if state.cache.is_empty() {
            return Err(Error::NotReady);
        }
        if count == 0 {
            return Err(Error::BadRequest(
                "requested cpu count must be greater than 0".into(),
            ));
        }
        let available = state.cache.len();
        if count > available {
            return Err(Error::InsufficientCapacity {
                requested: count,
                available,
            });
        }

        if let Some(existing) = state.selections.get(&vmid) {
            if existing.len() == count {
                return Ok(existing.clone());
            }
        }

        state.cursor = (state.cursor + 1) % available;
        let primary = &state.cache[state.cursor];

        let mut cpus = Vec::with_capacity(count);
        cpus.push(primary.cpu);
        cpus.extend(primary.ranking.iter().take(count - 1).map(|n| n.cpu));

        state.selections.insert(vmid, cpus.clone());
        Ok(cpus)
    }

    fn install(&self, rankings: Vec<CoreRanking>) {
        let mut state = self.state.write().unwrap();
        state.cache = rankings;
        // Keep the cursor within bounds if the topology shrank.
        if state.cache.is_empty() {
            state.cursor = 0;
        } else {
            state.cursor %= state.cache.len();
        }
        state.selections.clear();
    }

    fn sweep(
        &self,
        rounds: u32,
        iterations: u32,
        timeout: Option<Duration>,
        mut progress: impl FnMut(u32, u32),
    ) -> Result<Vec<CoreRanking>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let topology = self.probe.detect()?;
        if topology.is_empty() {
            return Err(Error::Topology("no processors found in sysfs".into()));
        }

        let n = topology.len();
        let mut lat_sums = vec![0.0f64; n * n];
        let mut lat_sq_sums = vec![0.0f64; n * n];

        for round in 0..rounds {
            progress(round + 1, rounds);
            for (i, src) in topology.iter().enumerate() {
                for (j, dst) in topology.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    if let (Some(d), Some(t)) = (deadline, timeout) {
                        if Instant::now() >= d {
                            return Err(Error::Timeout(t));
                        }
                    }
                    let lat = self.measurer.measure(src.cpu, dst.cpu, iterations)?;
                    lat_sums[i * n + j] += lat;
                    lat_sq_sums[i * n + j] += lat * lat;
                }
            }
        }

        let mut rankings = Vec::with_capacity(n);
        for (i, src) in topology.iter().enumerate() {
            let mut neighbors = Vec::with_capacity(n - 1);
            for (j, dst) in topology.iter().enumerate() {
                if i == j {
                    continue;
                }
                let mean = lat_sums[i * n + j] / f64::from(rounds);
                let variance =
                    (lat_sq_sums[i * n + j] / f64::from(rounds) - mean * mean).max(0.0);
                neighbors.push(Neighbor {
                    cpu: dst.cpu,
                    socket: dst.socket,
                    core: dst.core,
                    latency_ns: mean,
                    std_dev: variance.sqrt(),
                });
            }

            // Stable sort: equal latencies keep the traversal order of the
            // destinations.
            neighbors.sort_by(|a, b| a.latency_ns.total_cmp(&b.latency_ns));

            rankings.push(CoreRanking {
                cpu: src.cpu,
                ranking: neighbors,
            });
        }

        Ok(rankings)
    }
}

/// Compute aggregate statistics over a ranking.
pub fn summarize(rankings: &[CoreRanking]) -> RankingSummary {
    let mut cpus = BTreeSet::new();
    let mut sockets = BTreeSet::new();
    let mut latencies = Vec::new();

    for r in rankings {
        cpus.insert(r.cpu);
        for n in &r.ranking {
            cpus.insert(n.cpu);
            sockets.insert(n.socket);
            latencies.push(n.latency_ns);
        }
    }

    if latencies.is_empty() {
        return RankingSummary {
            cpu_count: cpus.len(),
            socket_count: sockets.len(),
            ..Default::default()
        };
    }

    latencies.sort_by(f64::total_cmp);
    let count = latencies.len();
    let median = if count % 2 == 1 {
        latencies[count / 2]
    } else {
        (latencies[count / 2 - 1] + latencies[count / 2]) / 2.0
    };

    RankingSummary {
        cpu_count: cpus.len(),
        socket_count: sockets.len(),
        min_latency_ns: latencies[0],
        max_latency_ns: latencies[count - 1],
        median_latency_ns: median,
        mean_latency_ns: latencies.iter().sum::<f64>() / count as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuTopology;
    use std::collections::BTreeSet;

    struct FixedProbe(Vec<CpuTopology>);

    impl TopologyProbe for FixedProbe {
        fn detect(&self) -> Result<Vec<CpuTopology>> {
            Ok(self.0.clone())
        }
    }

    type MeasureFn = dyn Fn(u32, u32, u32) -> Result<f64> + Send + Sync;

    struct FnMeasurer(Box<MeasureFn>);

    impl LinkMeasurer for FnMeasurer {
        fn measure(&self, a: u32, b: u32, iterations: u32) -> Result<f64> {
            (self.0)(a, b, iterations)
        }
    }

    fn flat_topology(n: u32) -> Vec<CpuTopology> {
        (0..n)
            .map(|cpu| CpuTopology {
                cpu,
                socket: cpu / 2,
                core: cpu as i32,
            })
            .collect()
    }

    /// Engine over `n` cpus where lat(i→j) grows with the cpu-id distance,
    /// so cpu k's nearest neighbors are its numeric neighbors.
    fn distance_engine(n: u32) -> RankingEngine {
        RankingEngine::with_parts(
            Box::new(FixedProbe(flat_topology(n))),
            Box::new(FnMeasurer(Box::new(|a, b, _| {
                Ok(f64::from(a.abs_diff(b)) * 10.0)
            }))),
        )
    }

    #[test]
    fn ranking_is_empty_before_first_update() {
        let engine = distance_engine(4);
        let err = engine.get_ranking().unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(matches!(err, Error::NotReady));
    }

    #[test]
    fn update_builds_complete_sorted_ranking() {
        let engine = distance_engine(4);
        engine.update(2, 100, |_, _| {}).unwrap();

        let ranking = engine.get_ranking().unwrap();
        assert_eq!(ranking.len(), 4);

        for entry in &ranking {
            let others: BTreeSet<u32> = entry.ranking.iter().map(|n| n.cpu).collect();
            assert_eq!(entry.ranking.len(), 3);
            assert!(!others.contains(&entry.cpu));
            let expected: BTreeSet<u32> = (0..4).filter(|&c| c != entry.cpu).collect();
            assert_eq!(others, expected);
            assert!(entry
                .ranking
                .windows(2)
                .all(|w| w[0].latency_ns <= w[1].latency_ns));
        }

        // cpu 2's nearest neighbors by distance are 1 and 3.
        let r2 = ranking.iter().find(|r| r.cpu == 2).unwrap();
        let nearest: BTreeSet<u32> = r2.ranking[..2].iter().map(|n| n.cpu).collect();
        assert_eq!(nearest, BTreeSet::from([1, 3]));
    }

    #[test]
    fn equal_latencies_keep_traversal_order() {
        let engine = RankingEngine::with_parts(
            Box::new(FixedProbe(flat_topology(4))),
            Box::new(FnMeasurer(Box::new(|_, _, _| Ok(42.0)))),
        );
        engine.update(1, 1, |_, _| {}).unwrap();

        let ranking = engine.get_ranking().unwrap();
        let r0 = &ranking[0];
        let order: Vec<u32> = r0.ranking.iter().map(|n| n.cpu).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn progress_fires_once_per_round() {
        let engine = distance_engine(2);
        let mut seen = Vec::new();
        engine
            .update(3, 1, |round, total| seen.push((round, total)))
            .unwrap();
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn measurement_error_discards_partial_results() {
        let good = distance_engine(3);
        good.update(1, 1, |_, _| {}).unwrap();
        let before = good.get_ranking().unwrap();

        // A sweep that fails mid-way must not leave a cache behind.
        let engine = RankingEngine::with_parts(
            Box::new(FixedProbe(flat_topology(3))),
            Box::new(FnMeasurer(Box::new(|a, b, _| {
                if a == 1 && b == 2 {
                    Err(Error::Pin {
                        cpu: b,
                        source: std::io::Error::other("no such cpu"),
                    })
                } else {
                    Ok(1.0)
                }
            }))),
        );
        assert!(engine.update(1, 1, |_, _| {}).is_err());
        assert!(matches!(engine.get_ranking(), Err(Error::NotReady)));

        // And a previously-populated engine is untouched by a failure.
        assert_eq!(good.get_ranking().unwrap(), before);
    }

    #[test]
    fn timeout_leaves_cache_untouched() {
        let engine = distance_engine(3);
        engine.update(1, 1, |_, _| {}).unwrap();
        let before = engine.get_ranking().unwrap();

        let err = engine
            .calculate_ranking(1, 1, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(engine.get_ranking().unwrap(), before);
    }

    #[test]
    fn update_clears_guest_selections() {
        let engine = distance_engine(4);
        engine.update(1, 1, |_, _| {}).unwrap();
        engine.select_cpus(100, 2).unwrap();
        assert_eq!(engine.guest_selections().len(), 1);

        engine.update(1, 1, |_, _| {}).unwrap();
        assert!(engine.guest_selections().is_empty());
    }

    #[test]
    fn selection_is_sticky_per_guest() {
        let engine = distance_engine(4);
        engine.update(1, 1, |_, _| {}).unwrap();

        let first = engine.select_cpus(100, 2).unwrap();
        let second = engine.select_cpus(100, 2).unwrap();
        assert_eq!(first, second);

        // A changed count re-selects.
        let third = engine.select_cpus(100, 3).unwrap();
        assert_eq!(third.len(), 3);
    }

    #[test]
    fn rotation_spreads_primary_cpus() {
        let engine = distance_engine(4);
        engine.update(1, 1, |_, _| {}).unwrap();
        let cache: Vec<u32> = engine.get_ranking().unwrap().iter().map(|r| r.cpu).collect();

        let primaries: Vec<u32> = (100..104)
            .map(|vmid| engine.select_cpus(vmid, 1).unwrap()[0])
            .collect();

        // The cursor advances before use: sources come out starting at
        // cache[1] and wrap around.
        assert_eq!(primaries, vec![cache[1], cache[2], cache[3], cache[0]]);
        let distinct: BTreeSet<u32> = primaries.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn selection_size_is_validated() {
        let engine = distance_engine(3);
        engine.update(1, 1, |_, _| {}).unwrap();

        assert!(matches!(
            engine.select_cpus(1, 0),
            Err(Error::BadRequest(_))
        ));

        let err = engine.select_cpus(1, 4).unwrap_err();
        assert!(err.to_string().contains("exceed"));
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn select_before_update_is_not_ready() {
        let engine = distance_engine(4);
        assert!(matches!(engine.select_cpus(1, 1), Err(Error::NotReady)));
    }

    #[test]
    fn selection_takes_nearest_neighbors_of_primary() {
        let engine = distance_engine(4);
        engine.update(1, 1, |_, _| {}).unwrap();

        // First selection: cursor advances to index 1, primary cpu 1, whose
        // nearest neighbors by distance are 0 and 2.
        let cpus = engine.select_cpus(100, 3).unwrap();
        assert_eq!(cpus[0], 1);
        let rest: BTreeSet<u32> = cpus[1..].iter().copied().collect();
        assert_eq!(rest, BTreeSet::from([0, 2]));
    }

    #[test]
    fn cursor_survives_topology_shrink() {
        // Probe that reports 4 cpus on the first run and 2 afterwards.
        struct ShrinkingProbe(std::sync::atomic::AtomicUsize);

        impl TopologyProbe for ShrinkingProbe {
            fn detect(&self) -> Result<Vec<CpuTopology>> {
                let runs = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(flat_topology(if runs == 0 { 4 } else { 2 }))
            }
        }

        let engine = RankingEngine::with_parts(
            Box::new(ShrinkingProbe(std::sync::atomic::AtomicUsize::new(0))),
            Box::new(FnMeasurer(Box::new(|a, b, _| {
                Ok(f64::from(a.abs_diff(b)) * 10.0)
            }))),
        );

        engine.update(1, 1, |_, _| {}).unwrap();
        // Drive the cursor to the end of the 4-entry cache.
        for vmid in 0..3 {
            engine.select_cpus(vmid, 1).unwrap();
        }

        // Rebuild with the smaller topology; selecting afterwards must not
        // index out of bounds.
        engine.update(1, 1, |_, _| {}).unwrap();
        assert_eq!(engine.get_ranking().unwrap().len(), 2);
        let cpus = engine.select_cpus(9, 2).unwrap();
        assert_eq!(cpus.len(), 2);
    }

    #[test]
    fn summary_orders_min_median_mean_max() {
        let engine = distance_engine(4);
        engine.update(1, 1, |_, _| {}).unwrap();

        let s = summarize(&engine.get_ranking().unwrap());
        assert_eq!(s.cpu_count, 4);
        assert_eq!(s.socket_count, 2);
        assert!(s.min_latency_ns <= s.median_latency_ns);
        assert!(s.median_latency_ns <= s.max_latency_ns);
        assert!(s.min_latency_ns <= s.mean_latency_ns);
        assert!(s.mean_latency_ns <= s.max_latency_ns);
    }

    #[test]
    fn summary_of_empty_ranking_is_zeroed() {
        let s = summarize(&[]);
        assert_eq!(s, RankingSummary::default());
    }

    #[test]
    fn mean_latency_averages_over_rounds() {
        // Two rounds of constant 10ns links must average to exactly 10.
        let engine = RankingEngine::with_parts(
            Box::new(FixedProbe(flat_topology(2))),
            Box::new(FnMeasurer(Box::new(|_, _, _| Ok(10.0)))),
        );
        engine.update(2, 1, |_, _| {}).unwrap();
        let ranking = engine.get_ranking().unwrap();
        assert_eq!(ranking[0].ranking[0].latency_ns, 10.0);
        assert_eq!(ranking[0].ranking[0].std_dev, 0.0);
    }
}
