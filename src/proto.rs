// SPDX-License-Identifier: GPL-2.0

//! Wire protocol of the local service socket.
//!
//! One JSON object per direction, newline-terminated, then the connection
//! closes. Requests carry a command name and an optional guest id; replies
//! carry a status, and either a data payload or an error message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CMD_PING: &str = "ping";
pub const CMD_CORE_RANKING: &str = "core-ranking";
pub const CMD_CORE_RANKING_SUMMARY: &str = "core-ranking-summary";
pub const CMD_CORE_VM_AFFINITY: &str = "core-vm-affinity";
pub const CMD_UPDATE_AFFINITY: &str = "update-affinity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.into(),
            vmid: None,
        }
    }

    pub fn with_vmid(command: &str, vmid: u32) -> Self {
        Self {
            command: command.into(),
            vmid: Some(vmid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
