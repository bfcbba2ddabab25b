// SPDX-License-Identifier: GPL-2.0

//! The placement service.
//!
//! Start order: config, log sink, initial ranking calculation (fatal on
//! failure), hotplug watchdog (best effort), socket service. SIGINT and
//! SIGTERM shut everything down in reverse; SIGHUP re-opens the log file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use pve_affinity::config::{Config, MAX_RANKING_DURATION};
use pve_affinity::hotplug::HotplugWatchdog;
use pve_affinity::logger::{parse_level, LogSink};
use pve_affinity::placement::PlacementScheduler;
use pve_affinity::pve::PveClient;
use pve_affinity::ranking::RankingEngine;
use pve_affinity::service::Service;

#[derive(Parser, Debug)]
#[command(author, version, about = "Latency-aware guest CPU placement service")]
struct Args {
    /// Path to the config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, action)]
    stderr: bool,

    /// Disable the cpu hotplug watchdog
    #[arg(long, action)]
    disable_hotplug_watchdog: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }
    if let Some(log_file) = args.log_file {
        cfg.log_file = log_file;
    }
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }
    if args.disable_hotplug_watchdog {
        cfg.hotplug_watchdog = false;
    }

    let level = parse_level(&cfg.log_level);
    let sink = if args.stderr {
        LogSink::stderr(level)
    } else {
        match LogSink::file(level, &cfg.log_file) {
            Ok(sink) => sink,
            Err(e) => {
                eprintln!(
                    "failed to open log file {:?}: {e}, logging to stderr",
                    cfg.log_file
                );
                LogSink::stderr(level)
            }
        }
    };
    sink.install().context("failed to install logger")?;

    info!("pve-affinity service starting");

    let engine = Arc::new(RankingEngine::new());

    // The initial ranking must exist before placements can be served.
    {
        let engine = engine.clone();
        let (rounds, iterations) = (cfg.rounds, cfg.iterations);
        tokio::task::spawn_blocking(move || {
            engine.calculate_ranking(rounds, iterations, MAX_RANKING_DURATION)
        })
        .await
        .context("ranking task failed")?
        .context("initial ranking calculation failed")?;
    }

    let mut watchdog = None;
    if cfg.hotplug_watchdog {
        match HotplugWatchdog::start(engine.clone(), cfg.rounds, cfg.iterations) {
            Ok(w) => watchdog = Some(w),
            Err(e) => warn!("failed to start cpu hotplug watchdog: {e}"),
        }
    }

    let pve = PveClient::new().context("failed to initialize hypervisor client")?;
    let scheduler = Arc::new(PlacementScheduler::new(engine.clone(), Box::new(pve)));
    let service = Service::new(
        cfg.socket_path.clone(),
        cfg.socket_timeout(),
        engine,
        scheduler,
    );

    let cancel = CancellationToken::new();
    let mut server = tokio::spawn({
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                match sink.reopen() {
                    Ok(()) => info!("log file reopened"),
                    Err(e) => error!("failed to reopen log file: {e}"),
                }
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            res = &mut server => {
                // The listener died on its own; surface the reason.
                if let Some(mut w) = watchdog.take() {
                    w.stop().await;
                }
                return res.context("service task failed")?;
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    server.await.context("service task failed")??;
    if let Some(mut w) = watchdog.take() {
        w.stop().await;
    }
    info!("shutdown complete");
    Ok(())
}
