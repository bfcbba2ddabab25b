// SPDX-License-Identifier: GPL-2.0

//! Guest lifecycle hook.
//!
//! Invoked by the hypervisor as `pve-affinity-hook <vmid> <phase>`. The
//! guest must never be blocked from running by this tool: every service
//! failure is reported and swallowed, and only argument errors exit
//! nonzero.

use std::process::ExitCode;

use clap::Parser;

use pve_affinity::client::ServiceClient;
use pve_affinity::config::Config;
use pve_affinity::proto::{Request, CMD_PING, CMD_UPDATE_AFFINITY};

#[derive(Parser, Debug)]
#[command(author, version, about = "Guest lifecycle hook for pve-affinity")]
struct Args {
    /// Guest id
    vmid: u32,

    /// Lifecycle phase: pre-start, post-start, pre-stop, post-stop
    phase: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let cfg = Config::load(None).unwrap_or_default();
    let client = ServiceClient::from_config(&cfg);

    match args.phase.as_str() {
        "pre-start" => {
            // The service might still be in its measurement loop; pinging
            // here delays the guest start until it is reachable, while the
            // host is not yet busy with qemu processes.
            if cfg.ping_on_pre_start {
                if let Err(e) = client.request_with_retry(&Request::new(CMD_PING)) {
                    println!("Warning: service not reachable: {e}");
                }
            }
        }
        "post-start" => {
            if let Err(e) =
                client.request_with_retry(&Request::with_vmid(CMD_UPDATE_AFFINITY, args.vmid))
            {
                println!("Error calling service: {e}");
            }
        }
        "pre-stop" | "post-stop" => {}
        other => {
            eprintln!("got unknown phase '{other}'");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}
