// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the ranking engine and the placement scheduler.
///
/// Per-task affinity failures and per-thread enumeration failures are not
/// represented here: they are logged and the operation continues.
#[derive(Debug, Error)]
pub enum Error {
    /// Ranking requested before the first measurement sweep completed.
    #[error("core ranking cache is empty, no measurement has completed yet")]
    NotReady,

    /// The caller asked for something nonsensical.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// More processors requested than the host has.
    #[error("requested cpus {requested} exceed available {available}")]
    InsufficientCapacity { requested: usize, available: usize },

    /// The measurement sweep ran past its wall-clock cap. The previous
    /// ranking cache is left untouched.
    #[error("ranking calculation timed out after {0:?}, adjust rounds/iterations")]
    Timeout(Duration),

    /// The guest has no live root process.
    #[error("guest {0} is not running")]
    NotRunning(u32),

    /// Cannot pin a measurement thread to its processor.
    #[error("failed to pin measurement thread to cpu {cpu}: {source}")]
    Pin {
        cpu: u32,
        source: std::io::Error,
    },

    /// Topology enumeration failed outright.
    #[error("failed to enumerate processor topology: {0}")]
    Topology(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
