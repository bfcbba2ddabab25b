// SPDX-License-Identifier: GPL-2.0

//! Processor hotplug watchdog.
//!
//! Subscribes to the kernel's kobject uevent multicast group and reacts to
//! processor add/remove events by recomputing the latency ranking. Bursts
//! are debounced: each event resets a batching window, and only when the
//! window expires does the batch trigger one recomputation. The job queue
//! holds a single batch, so at most one recomputation is ever in flight;
//! a batch arriving while one is running is dropped with a warning, and the
//! next event starts a new cycle.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{HOTPLUG_BATCH_WINDOW, MAX_RANKING_DURATION};
use crate::ranking::RankingEngine;

/// Kobject uevent multicast group id.
const UEVENT_MCAST_GROUP: u32 = 1;

/// Bounded buffers keep bursts from blocking the netlink reader.
pub const EVENT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    Add,
    Remove,
}

impl fmt::Display for CpuAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuAction::Add => write!(f, "add"),
            CpuAction::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuEvent {
    /// Kernel name of the processor, e.g. `cpu3`.
    pub cpu: String,
    pub action: CpuAction,
}

/// Debounced event batching, separated from the netlink plumbing so the
/// timing logic is testable on its own.
pub struct Reactor {
    events_tx: mpsc::Sender<CpuEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Reactor {
    /// Spawn the batching and worker tasks. `handler` runs on the blocking
    /// pool, once per expired batch.
    pub fn start<F>(window: Duration, handler: F) -> Self
    where
        F: Fn(Vec<CpuEvent>) + Send + Sync + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(run_batcher(events_rx, jobs_tx, window, cancel.clone())),
            tokio::spawn(run_worker(jobs_rx, Arc::new(handler), cancel.clone())),
        ];

        Self {
            events_tx,
            cancel,
            tasks,
        }
    }

    /// Queue an event for batching. Never blocks; overflow drops the event
    /// with a warning, which is harmless because batches are coalesced
    /// anyway.
    pub fn ingest(&self, event: CpuEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("hotplug event buffer full, dropping event");
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_batcher(
    mut events: mpsc::Receiver<CpuEvent>,
    jobs: mpsc::Sender<Vec<CpuEvent>>,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut batch: Vec<CpuEvent> = Vec::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let window_expired = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                debug!(
                    "buffering hotplug event {} {}, batch size {}",
                    event.action,
                    event.cpu,
                    batch.len() + 1
                );
                batch.push(event);
                // Each event extends the window.
                deadline = Some(tokio::time::Instant::now() + window);
            }
            _ = window_expired => {
                deadline = None;
                if batch.is_empty() {
                    continue;
                }
                let job = std::mem::take(&mut batch);
                let size = job.len();
                match jobs.try_send(job) {
                    Ok(()) => info!("hotplug batch of {size} handed to worker"),
                    Err(_) => warn!("hotplug job queue full, dropping batch of {size}"),
                }
            }
        }
    }
}

async fn run_worker(
    mut jobs: mpsc::Receiver<Vec<CpuEvent>>,
    handler: Arc<dyn Fn(Vec<CpuEvent>) + Send + Sync>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            job = jobs.recv() => {
                let Some(batch) = job else { return };
                let handler = handler.clone();
                // The handler recomputes the ranking, which busy-spins for
                // a long time; keep it off the async workers and finish it
                // before accepting the next batch.
                if tokio::task::spawn_blocking(move || (*handler)(batch)).await.is_err() {
                    error!("hotplug batch handler panicked");
                }
            }
        }
    }
}

/// The netlink-facing half: owns the uevent socket and feeds the reactor.
pub struct HotplugWatchdog {
    reactor: Option<Reactor>,
    reader: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl HotplugWatchdog {
    /// Subscribe to kernel uevents and start reacting to processor
    /// hotplug. Recomputations use the given measurement parameters.
    pub fn start(engine: Arc<RankingEngine>, rounds: u32, iterations: u32) -> Result<Self> {
        info!("starting cpu hotplug watchdog");

        let reactor = Reactor::start(HOTPLUG_BATCH_WINDOW, move |batch: Vec<CpuEvent>| {
            info!(
                "cpu hotplug detected ({} events), recalculating ranking",
                batch.len()
            );
            if let Err(e) = engine.calculate_ranking(rounds, iterations, MAX_RANKING_DURATION) {
                error!("failed to recalculate ranking after hotplug: {e}");
            }
        });

        let fd = open_uevent_socket().context("failed to subscribe to kernel uevents")?;
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(run_reader(
            fd,
            reactor.events_tx.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            reactor: Some(reactor),
            reader: Some(reader),
            cancel,
        })
    }

    /// Unblock the socket read, cancel in-flight batching and join all
    /// tasks. Idempotent.
    pub async fn stop(&mut self) {
        info!("stopping cpu hotplug watchdog");
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        if let Some(reactor) = self.reactor.take() {
            reactor.stop().await;
        }
    }
}

fn open_uevent_socket() -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .context("failed to create netlink socket")?;

    // Pid 0 lets the kernel pick the port id; group 1 is the uevent
    // multicast group.
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, UEVENT_MCAST_GROUP))
        .context("failed to bind netlink socket")?;

    Ok(fd)
}

async fn run_reader(fd: OwnedFd, events: mpsc::Sender<CpuEvent>, cancel: CancellationToken) {
    let afd = match AsyncFd::new(fd) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to register netlink socket with the runtime: {e}");
            return;
        }
    };
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            guard = afd.readable() => {
                let mut guard = match guard {
                    Ok(g) => g,
                    Err(e) => {
                        debug!("netlink socket read error (stopping?): {e}");
                        return;
                    }
                };
                match guard.try_io(|inner| {
                    recv(inner.get_ref().as_raw_fd(), &mut buf, MsgFlags::empty())
                        .map_err(std::io::Error::from)
                }) {
                    Ok(Ok(n)) => {
                        if let Some(event) = parse_uevent(&buf[..n]) {
                            if events.try_send(event).is_err() {
                                warn!("hotplug event buffer full, dropping event");
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("netlink socket read error (stopping?): {e}");
                        return;
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

/// Extract a processor hotplug event from a raw uevent message.
///
/// The payload is a NUL-separated list: a `action@devpath` header followed
/// by `KEY=value` pairs. Only cpu-subsystem add/remove events are of
/// interest.
fn parse_uevent(buf: &[u8]) -> Option<CpuEvent> {
    let msg = String::from_utf8_lossy(buf);
    let mut action = None;
    let mut devpath = None;
    let mut is_cpu = false;

    for field in msg.split('\0') {
        if let Some(value) = field.strip_prefix("ACTION=") {
            action = match value {
                "add" => Some(CpuAction::Add),
                "remove" => Some(CpuAction::Remove),
                _ => return None,
            };
        } else if let Some(value) = field.strip_prefix("DEVPATH=") {
            devpath = Some(value);
        } else if let Some(value) = field.strip_prefix("SUBSYSTEM=") {
            is_cpu = value == "cpu";
        }
    }

    if !is_cpu {
        return None;
    }

    let name = devpath?.rsplit('/').next()?;
    let digits = name.strip_prefix("cpu")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(CpuEvent {
        cpu: name.to_string(),
        action: action?,
    })
}
