//! PTY supervision for the publish and revert commands.
//!
//! Spawns a command in a pseudo-terminal (publish tools only prompt for a
//! one-time password when they see a TTY) and turns its I/O into events on
//! an `mpsc` channel:
//!
//! - a reader thread sends [`ProcessEvent::Output`] for every chunk read
//!   from the PTY master, in order;
//! - a waiter thread sends exactly one [`ProcessEvent::Exited`] once the
//!   child has exited and the reader has drained (or a short grace period
//!   has passed).
//!
//! The returned [`ProcessHandle`] writes input and kills the child. It kills
//! on drop, so every exit path of a session releases the process. A kill
//! sends SIGHUP first; a child still running after [`KILL_GRACE`] gets
//! SIGKILL, along with the rest of its process group.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

/// How long the waiter gives the reader to drain output after exit.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long a killed child gets to exit on SIGHUP before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Configuration for spawning a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; the current directory when `None`.
    pub work_dir: Option<PathBuf>,
    /// Extra variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            work_dir: None,
            env: vec![],
        }
    }
}

pub fn default_pty_size() -> PtySize {
    PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Events emitted by a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of output, as read from the PTY.
    Output(String),
    /// The process exited. Always the last event.
    Exited(u32),
}

/// Live handle on a supervised process.
pub struct ProcessHandle {
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessHandle {
    /// Write `text` followed by a newline to the process input.
    pub fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Kill the process. Safe to call repeatedly and after exit.
    ///
    /// Blocks for at most [`KILL_GRACE`] waiting for the child to go away
    /// before escalating.
    pub fn kill(&mut self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        match self.killer.kill() {
            Ok(()) => info!(pid = ?self.pid, "sent SIGHUP to supervised process"),
            Err(e) => debug!(pid = ?self.pid, error = %e, "kill failed (process likely exited)"),
        }
        if self.wait_for_exit(KILL_GRACE) {
            return;
        }
        self.force_kill();
    }

    fn wait_for_exit(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.exited.load(Ordering::SeqCst)
    }

    /// SIGKILL the child's process group. The child leads its own session,
    /// so its pid is also the group id.
    #[cfg(unix)]
    fn force_kill(&mut self) {
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return;
        };
        warn!(pid, "process ignored SIGHUP, sending SIGKILL");
        // SAFETY: kill(2) only takes integers; pid comes from our own child.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc != 0 {
            // No group (or already gone): fall back to the child itself.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            debug!(pid = ?self.pid, error = %e, "second kill failed");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn `config` in a PTY and stream its events into `events`.
pub fn spawn<E>(config: &SpawnConfig, pty_size: PtySize, events: mpsc::Sender<E>) -> Result<ProcessHandle>
where
    E: From<ProcessEvent> + Send + 'static,
{
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(pty_size).context("failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&config.program);
    for arg in &config.args {
        cmd.arg(arg);
    }
    // portable-pty falls back to $HOME when no cwd is given.
    let work_dir = match &config.work_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    cmd.cwd(&work_dir);
    for (key, val) in &config.env {
        cmd.env(key, val);
    }

    info!(
        program = %config.program,
        args = config.args.len(),
        work_dir = %work_dir.display(),
        "spawning command in PTY"
    );

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("failed to spawn '{}'", config.program))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone PTY reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("failed to take PTY writer")?;

    let (drained_tx, drained_rx) = mpsc::channel::<()>();
    let output_tx = events.clone();
    thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            read_output(reader, &output_tx);
            let _ = drained_tx.send(());
        })
        .context("failed to spawn PTY reader thread")?;

    let exited = Arc::new(AtomicBool::new(false));
    let exited_flag = exited.clone();
    thread::Builder::new()
        .name("pty-waiter".to_string())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(e) => {
                    warn!(error = %e, "failed to wait for process");
                    1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = drained_rx.recv_timeout(EXIT_DRAIN_GRACE);
            info!(code, "process exited");
            let _ = events.send(ProcessEvent::Exited(code).into());
        })
        .context("failed to spawn PTY waiter thread")?;

    Ok(ProcessHandle {
        writer,
        killer,
        exited,
        pid,
        _master: pair.master,
    })
}

fn read_output<E: From<ProcessEvent>>(mut reader: Box<dyn Read + Send>, events: &mpsc::Sender<E>) {
    let mut buf = [0u8; 4096];
    let mut decoder = Utf8Stream::default();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("PTY read error (process likely exited): {e}");
                break;
            }
        };
        let text = decoder.decode(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        if events.send(ProcessEvent::Output(text).into()).is_err() {
            break;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(ProcessEvent::Output(rest).into());
    }
}

/// UTF-8 decoder that carries an incomplete trailing sequence over to the
/// next chunk instead of mangling it.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = match std::str::from_utf8(&self.pending) {
            Ok(_) => 0,
            Err(e) if e.error_len().is_none() => self.pending.len() - e.valid_up_to(),
            Err(_) => 0,
        };
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    /// Collect events until exit or `limit`.
    fn collect(rx: &mpsc::Receiver<ProcessEvent>, limit: Duration) -> (String, Option<u32>) {
        let deadline = Instant::now() + limit;
        let mut output = String::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(ProcessEvent::Output(chunk)) => output.push_str(&chunk),
                Ok(ProcessEvent::Exited(code)) => return (output, Some(code)),
                Err(_) => break,
            }
        }
        (output, None)
    }

    #[test]
    fn echo_output_and_zero_exit() {
        let (tx, rx) = mpsc::channel();
        let _handle = spawn(&SpawnConfig::new("echo", vec!["hello from pty".to_string()]), default_pty_size(), tx).unwrap();

        let (output, code) = collect(&rx, Duration::from_secs(10));
        assert!(output.contains("hello from pty"), "got: {output:?}");
        assert_eq!(code, Some(0));
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let (tx, rx) = mpsc::channel();
        let _handle = spawn(&sh("exit 3"), default_pty_size(), tx).unwrap();

        let (_, code) = collect(&rx, Duration::from_secs(10));
        assert_eq!(code, Some(3));
    }

    #[test]
    fn written_line_reaches_the_process() {
        let (tx, rx) = mpsc::channel();
        let mut handle = spawn(&sh(r#"read line; echo "got:$line""#), default_pty_size(), tx).unwrap();
        handle.write_line("123456").unwrap();

        let (output, code) = collect(&rx, Duration::from_secs(10));
        assert!(output.contains("got:123456"), "got: {output:?}");
        assert_eq!(code, Some(0));
    }

    #[test]
    fn extra_env_and_work_dir_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sh(r#"echo "$RELAY_TEST_VAR"; pwd"#);
        config.env.push(("RELAY_TEST_VAR".to_string(), "from-env".to_string()));
        config.work_dir = Some(tmp.path().to_path_buf());

        let (tx, rx) = mpsc::channel();
        let _handle = spawn(&config, default_pty_size(), tx).unwrap();

        let (output, _) = collect(&rx, Duration::from_secs(10));
        assert!(output.contains("from-env"), "got: {output:?}");
        let dir_name = tmp.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(output.contains(&dir_name), "got: {output:?}");
    }

    #[test]
    fn kill_terminates_and_is_idempotent() {
        let (tx, rx) = mpsc::channel();
        let mut handle = spawn(&sh("sleep 30"), default_pty_size(), tx).unwrap();
        assert!(handle.pid().is_some());

        handle.kill();
        let (_, code) = collect(&rx, Duration::from_secs(10));
        assert!(code.is_some(), "killed process should report exit");
        handle.kill();
    }

    #[test]
    #[cfg(unix)]
    fn child_ignoring_sighup_is_force_killed() {
        let (tx, rx) = mpsc::channel();
        let mut handle = spawn(&sh("trap '' HUP; sleep 30"), default_pty_size(), tx).unwrap();
        // let the shell install its trap
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        handle.kill();
        let (_, code) = collect(&rx, Duration::from_secs(10));
        assert!(code.is_some(), "process ignoring SIGHUP should still exit");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn dropping_the_handle_kills_the_process() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn(&sh("sleep 30"), default_pty_size(), tx).unwrap();
        drop(handle);

        let (_, code) = collect(&rx, Duration::from_secs(10));
        assert!(code.is_some());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let (tx, _rx) = mpsc::channel::<ProcessEvent>();
        let result = spawn(
            &SpawnConfig::new("/nonexistent/definitely-not-a-program", vec![]),
            default_pty_size(),
            tx,
        );
        assert!(result.is_err());
    }

    #[test]
    fn utf8_sequences_split_across_reads_are_rejoined() {
        let mut stream = Utf8Stream::default();
        let bytes = "✓ published".as_bytes();
        assert_eq!(stream.decode(&bytes[..1]), "");
        assert_eq!(stream.decode(&bytes[1..]), "✓ published");
        assert_eq!(stream.finish(), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(b"ok \xff done"), "ok \u{fffd} done");
    }
}
