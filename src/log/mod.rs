//! Structured session log: one JSON line per event.
//!
//! When enabled, every session appends one self-contained JSON object per
//! event: the command launch, 2FA prompt detection, the code round-trip,
//! process exit, timeouts, the final outcome and any revert. The 2FA code
//! itself is never written, only its length.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// A structured event in the session log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        program: String,
        args: usize,
        timeout_ms: u64,
    },
    /// The 2FA prompt matched for the first (and only) time.
    PromptDetected { pattern: String },
    /// The relay was started with this sub-timeout.
    CodeRequested { budget_ms: u64 },
    CodeInjected { length: usize },
    RelayFailed { reason: String },
    ProcessExited { code: u32 },
    SessionTimedOut { budget_ms: u64 },
    SessionEnded { success: bool, message: String },
    RevertStarted { program: String },
    RevertFinished { success: bool, detail: String },
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open (or create) the log at `path`, creating parent directories.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        debug!(event = %json, "session log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Log an event, downgrading failures to a warning.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "failed to write session log");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
