// SPDX-License-Identifier: GPL-2.0

//! Operator CLI for the placement service.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use pve_affinity::client::ServiceClient;
use pve_affinity::config::{Config, MAX_RANKING_DURATION};
use pve_affinity::logger::LogSink;
use pve_affinity::proto::{
    Request, CMD_CORE_RANKING, CMD_CORE_RANKING_SUMMARY, CMD_CORE_VM_AFFINITY, CMD_PING,
    CMD_UPDATE_AFFINITY,
};
use pve_affinity::ranking::{summarize, RankingEngine};

#[derive(Parser, Debug)]
#[command(author, version, about = "Operator CLI for the pve-affinity service")]
struct Cli {
    /// Unix socket path of the service
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the service is alive
    Ping,
    /// Print the full core-to-core latency ranking
    CoreRanking,
    /// Print aggregate ranking statistics
    Summary,
    /// Print the current guest cpu selections
    VmAffinity,
    /// Apply placement for a running guest
    UpdateAffinity { vmid: u32 },
    /// Measure and print the local ranking without the service
    Cpuinfo {
        #[arg(long)]
        rounds: Option<u32>,
        #[arg(long)]
        iterations: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut cfg = Config::load(None).unwrap_or_default();
    if let Some(socket) = cli.socket {
        cfg.socket_path = socket;
    }

    let request = match &cli.command {
        Command::Ping => Request::new(CMD_PING),
        Command::CoreRanking => Request::new(CMD_CORE_RANKING),
        Command::Summary => Request::new(CMD_CORE_RANKING_SUMMARY),
        Command::VmAffinity => Request::new(CMD_CORE_VM_AFFINITY),
        Command::UpdateAffinity { vmid } => Request::with_vmid(CMD_UPDATE_AFFINITY, *vmid),
        Command::Cpuinfo { rounds, iterations } => {
            return run_cpuinfo(&cfg, *rounds, *iterations);
        }
    };

    let client = ServiceClient::new(&cfg.socket_path);
    match client.request(&request) {
        Ok(response) if response.is_ok() => {
            let data = response.data.unwrap_or(json!(null));
            println!(
                "{}",
                serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
            );
            ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("error: {}", response.error.unwrap_or_default());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// One-shot local measurement, bypassing the service entirely.
fn run_cpuinfo(cfg: &Config, rounds: Option<u32>, iterations: Option<u32>) -> ExitCode {
    let _ = LogSink::stderr(log::LevelFilter::Warn).install();

    let engine = Arc::new(RankingEngine::new());
    let rounds = rounds.unwrap_or(cfg.rounds);
    let iterations = iterations.unwrap_or(cfg.iterations);

    if let Err(e) = engine.calculate_ranking(rounds, iterations, MAX_RANKING_DURATION) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    let ranking = match engine.get_ranking() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let out = json!({
        "ranking": ranking,
        "summary": summarize(&ranking),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string())
    );
    ExitCode::SUCCESS
}
