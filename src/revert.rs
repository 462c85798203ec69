//! Compensating command run after a failed publish.
//!
//! Best-effort: the revert gets its own deadline, streams its output like
//! the publish command does, and its failure is only ever logged.

use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use portable_pty::PtySize;
use tracing::{info, warn};

use crate::error::RevertError;
use crate::log::millis;
use crate::supervisor::{self, ProcessEvent, SpawnConfig};

pub struct RevertExecutor {
    spawn: SpawnConfig,
    timeout: Duration,
    pty_size: PtySize,
}

impl RevertExecutor {
    pub fn new(spawn: SpawnConfig, timeout: Duration) -> Self {
        Self {
            spawn,
            timeout,
            pty_size: supervisor::default_pty_size(),
        }
    }

    pub fn program(&self) -> &str {
        &self.spawn.program
    }

    /// Run the revert command to completion or until its timeout.
    pub fn run(&self, out: &mut dyn Write) -> Result<(), RevertError> {
        info!(program = %self.spawn.program, timeout_ms = millis(self.timeout), "running revert command");
        let (tx, rx) = mpsc::channel::<ProcessEvent>();
        let mut process =
            supervisor::spawn(&self.spawn, self.pty_size, tx).map_err(RevertError::Spawn)?;
        let deadline = Instant::now() + self.timeout;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(ProcessEvent::Output(chunk)) => {
                    let _ = out.write_all(chunk.as_bytes());
                    let _ = out.flush();
                }
                Ok(ProcessEvent::Exited(0)) => {
                    info!("revert command succeeded");
                    return Ok(());
                }
                Ok(ProcessEvent::Exited(code)) => return Err(RevertError::Exit { code }),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    process.kill();
                    return Err(RevertError::Timeout {
                        budget: self.timeout,
                    });
                }
            }
        }
    }

    /// Run and log any failure. The result is informational only.
    pub fn run_logged(&self, out: &mut dyn Write) -> Result<(), RevertError> {
        let result = self.run(out);
        if let Err(e) = &result {
            warn!(kind = ?e.kind(), error = %e, "revert command failed");
        }
        result
    }
}
