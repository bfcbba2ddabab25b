// SPDX-License-Identifier: GPL-2.0

//! Blocking client for the service socket, used by the lifecycle hook and
//! the operator CLI. One connection per request: connect, send a single
//! newline-framed JSON object, read the single reply, done.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::proto::{Request, Response};

pub struct ServiceClient {
    socket_path: PathBuf,
    timeout: Duration,
    retries: u32,
    retry_sleep: Duration,
}

impl ServiceClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(5),
            retries: 0,
            retry_sleep: Duration::ZERO,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            socket_path: cfg.socket_path.clone(),
            timeout: cfg.socket_timeout(),
            retries: cfg.socket_retry,
            retry_sleep: cfg.socket_sleep(),
        }
    }

    /// One exchange, no retries. Error responses come back as `Ok` with
    /// `status == "error"`.
    pub fn request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("connecting to {:?}", self.socket_path))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut encoded = serde_json::to_string(request)?;
        encoded.push('\n');
        (&stream).write_all(encoded.as_bytes())?;

        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line)?;
        if line.trim().is_empty() {
            bail!("service closed the connection without a reply");
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Exchange with bounded retries; a transport failure or an error
    /// response both count as a failed attempt.
    pub fn request_with_retry(&self, request: &Request) -> Result<Response> {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                std::thread::sleep(self.retry_sleep);
            }
            match self.request(request) {
                Ok(response) if response.is_ok() => return Ok(response),
                Ok(response) => {
                    last_err = Some(anyhow::anyhow!(
                        "service returned error: {}",
                        response.error.unwrap_or_default()
                    ));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
    }
}
