// SPDX-License-Identifier: GPL-2.0

//! The local service socket.
//!
//! Listens on a unix stream socket, one JSON request and one JSON reply per
//! connection. Handlers are read-only except `update-affinity`, which
//! serializes at the placement scheduler. Every connection gets its own
//! task and an end-to-end deadline; a broken stream is logged and dropped.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::placement::PlacementScheduler;
use crate::proto::{
    Request, Response, CMD_CORE_RANKING, CMD_CORE_RANKING_SUMMARY, CMD_CORE_VM_AFFINITY,
    CMD_PING, CMD_UPDATE_AFFINITY,
};
use crate::ranking::{summarize, RankingEngine};

pub struct Service {
    socket_path: PathBuf,
    timeout: Duration,
    engine: Arc<RankingEngine>,
    scheduler: Arc<PlacementScheduler>,
}

impl Service {
    pub fn new(
        socket_path: PathBuf,
        timeout: Duration,
        engine: Arc<RankingEngine>,
        scheduler: Arc<PlacementScheduler>,
    ) -> Self {
        Self {
            socket_path,
            timeout,
            engine,
            scheduler,
        }
    }

    /// Bind the socket and serve until `cancel` fires. In-flight handlers
    /// are drained before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
        }

        // A stale socket from a previous run blocks bind.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("removing stale socket {:?}", self.socket_path))
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding unix socket {:?}", self.socket_path))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {:?}", self.socket_path))?;

        info!("service listening on {:?}", self.socket_path);

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("closing service socket");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let engine = self.engine.clone();
                            let scheduler = self.scheduler.clone();
                            let timeout = self.timeout;
                            tracker.spawn(async move {
                                handle_connection(stream, engine, scheduler, timeout).await;
                            });
                        }
                        Err(e) => warn!("failed to accept connection: {e}"),
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    engine: Arc<RankingEngine>,
    scheduler: Arc<PlacementScheduler>,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, serve_one(stream, engine, scheduler)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("connection dropped: {e}"),
        Err(_) => warn!("connection handler exceeded its {timeout:?} deadline"),
    }
}

async fn serve_one(
    mut stream: UnixStream,
    engine: Arc<RankingEngine>,
    scheduler: Arc<PlacementScheduler>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    // Client connected and went away without sending anything.
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => dispatch(request, engine, scheduler).await,
        Err(e) => {
            warn!("failed to decode request: {e}");
            Response::error(format!("failed to decode request: {e}"))
        }
    };

    let mut encoded = serde_json::to_string(&response)?;
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await?;
    Ok(())
}

async fn dispatch(
    request: Request,
    engine: Arc<RankingEngine>,
    scheduler: Arc<PlacementScheduler>,
) -> Response {
    match request.command.as_str() {
        CMD_PING => {
            debug!("ping received");
            Response::ok(json!("pong"))
        }
        CMD_CORE_RANKING => match engine.get_ranking() {
            Ok(ranking) => ok_json(&ranking),
            Err(e) => Response::error(e.to_string()),
        },
        CMD_CORE_RANKING_SUMMARY => match engine.get_ranking() {
            Ok(ranking) => ok_json(&summarize(&ranking)),
            Err(e) => Response::error(e.to_string()),
        },
        CMD_CORE_VM_AFFINITY => ok_json(&engine.guest_selections()),
        CMD_UPDATE_AFFINITY => {
            let Some(vmid) = request.vmid else {
                return Response::error("update-affinity requires a vmid");
            };
            // Placement shells out and walks /proc; keep it off the
            // async workers.
            match tokio::task::spawn_blocking(move || scheduler.apply_placement(vmid)).await {
                Ok(Ok(outcome)) => ok_json(&outcome),
                Ok(Err(e)) => Response::error(e.to_string()),
                Err(e) => Response::error(format!("placement task failed: {e}")),
            }
        }
        other => Response::error(format!("unknown command: {other}")),
    }
}

fn ok_json<T: serde::Serialize>(data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => Response::ok(value),
        Err(e) => Response::error(format!("failed to encode response: {e}")),
    }
}
