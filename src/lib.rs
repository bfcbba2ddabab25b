// SPDX-License-Identifier: GPL-2.0

//! Latency-aware guest CPU placement for Proxmox VE hosts.
//!
//! The service measures the pairwise core-to-core communication cost of the
//! running hardware with pinned ping-pong threads, keeps a per-CPU ranking of
//! the most affine neighbors, and binds the threads of a starting guest to a
//! latency-minimized subset of processors. Guest lifecycle hooks and operator
//! tools talk to the long-lived service over a local unix stream socket.

pub mod client;
pub mod config;
pub mod error;
pub mod hotplug;
pub mod latency;
pub mod logger;
pub mod placement;
pub mod proto;
pub mod pve;
pub mod ranking;
pub mod service;
pub mod topology;

pub use error::Error;
pub use ranking::{CoreRanking, Neighbor, RankingEngine, RankingSummary};
pub use topology::CpuTopology;
