// SPDX-License-Identifier: GPL-2.0

//! Log sink for the service and the command-line tools.
//!
//! Writes timestamped lines either to stderr or to an append-mode,
//! owner-only log file. The file variant supports re-opening at the same
//! path, which the service triggers on SIGHUP so external rotation works
//! without a restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{LevelFilter, Metadata, Record};

enum Output {
    Stderr,
    File { path: PathBuf, file: File },
}

pub struct LogSink {
    level: LevelFilter,
    output: Mutex<Output>,
}

impl LogSink {
    pub fn stderr(level: LevelFilter) -> Arc<Self> {
        Arc::new(Self {
            level,
            output: Mutex::new(Output::Stderr),
        })
    }

    pub fn file<P: AsRef<Path>>(level: LevelFilter, path: P) -> std::io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_log_file(&path)?;
        Ok(Arc::new(Self {
            level,
            output: Mutex::new(Output::File { path, file }),
        }))
    }

    /// Register this sink as the global logger.
    pub fn install(self: &Arc<Self>) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.level);
        log::set_boxed_logger(Box::new(SinkHandle(self.clone())))
    }

    /// Re-open the log file at its original path. No-op for the stderr
    /// variant.
    pub fn reopen(&self) -> std::io::Result<()> {
        let mut output = self.output.lock().unwrap();
        if let Output::File { path, file } = &mut *output {
            *file = open_log_file(path)?;
        }
        Ok(())
    }

    fn write_line(&self, record: &Record) {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("{now} [{:5}] {}\n", record.level(), record.args());

        let mut output = self.output.lock().unwrap();
        let res = match &mut *output {
            Output::Stderr => std::io::stderr().write_all(line.as_bytes()),
            Output::File { file, .. } => file.write_all(line.as_bytes()),
        };
        // Nowhere to report a failed log write.
        let _ = res;
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

struct SinkHandle(Arc<LogSink>);

impl log::Log for SinkHandle {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.0.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.0.write_line(record);
        }
    }

    fn flush(&self) {}
}

/// Parse a log level name the way the service's config expects it.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), LevelFilter::Warn);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn reopen_switches_to_new_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("svc.log");
        let sink = LogSink::file(LevelFilter::Info, &path).unwrap();

        // Simulate rotation: move the live file away, then reopen.
        std::fs::rename(&path, tmp.path().join("svc.log.1")).unwrap();
        sink.reopen().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn reopen_on_stderr_sink_is_a_noop() {
        let sink = LogSink::stderr(LevelFilter::Info);
        sink.reopen().unwrap();
    }
}
