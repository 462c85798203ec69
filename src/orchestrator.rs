//! Drives one publish attempt from spawn to final report.
//!
//! It:
//! 1. Spawns the publish command in a PTY
//! 2. Streams its output through the gate, watching for the 2FA prompt
//! 3. On the first match, relays a code request through the channel
//! 4. Injects the code and mutes its echo
//! 5. Resolves exactly one outcome from process exit, the global deadline,
//!    a relay failure or an interrupt
//! 6. Reports the outcome and runs the revert command on failure
//!
//! ## State machine
//!
//! ```text
//! RUNNING → prompt matched (once) → AWAITING_CODE → code → INJECTING → RUNNING
//!    │                                   │
//!    │                                   └─ relay error ───────────────┐
//!    ├─ exit 0 ─────────────────────────────────────────→ SUCCEEDED    │
//!    └─ exit ≠ 0 / deadline / interrupt ────────────────→ FAILED ←─────┘
//! ```
//!
//! [`Session`] is the pure state machine: it consumes events and returns
//! [`Action`]s. [`run`] is the driver: a single consumer of an `mpsc` queue
//! fed by the PTY threads and the relay thread, so chunks are handled one
//! at a time and in order.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::PtySize;
use tracing::{debug, info, warn};

use crate::channel;
use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::gate::OutputGate;
use crate::log::{ExecutionLog, LogEvent, millis};
use crate::prompt::CodePrompt;
use crate::relay::CodeRelay;
use crate::revert::RevertExecutor;
use crate::supervisor::{self, ProcessEvent, SpawnConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    AwaitingCode,
    Injecting,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(String),
    Failure(SessionError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The text reported to the channel.
    pub fn message(&self) -> String {
        match self {
            Self::Success(message) => message.clone(),
            Self::Failure(error) => error.to_string(),
        }
    }
}

/// What the driver must do in response to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this output to the user's terminal.
    Forward(String),
    /// Start the code relay with this sub-timeout.
    RequestCode { budget: Duration },
    /// Write the code (plus newline) to the process.
    Inject(String),
    /// Kill the process now.
    Kill,
}

/// Session state for one publish attempt.
pub struct Session {
    prompt: CodePrompt,
    state: SessionState,
    matched: bool,
    gate: OutputGate,
    timeout: Duration,
    deadline: Instant,
    outcome: Option<Outcome>,
}

impl Session {
    pub fn new(prompt: CodePrompt, timeout: Duration, started: Instant) -> Self {
        Self {
            prompt,
            state: SessionState::Running,
            matched: false,
            gate: OutputGate::new(),
            timeout,
            deadline: started + timeout,
            outcome: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.gate.is_muted()
    }

    /// A chunk of process output arrived.
    ///
    /// Detection runs on the raw chunk, before the gate decides whether to
    /// show it. `matched` is set here, before the relay is started, so a
    /// later chunk can never start a second relay.
    pub fn on_output(&mut self, chunk: &str, now: Instant) -> Vec<Action> {
        if self.state.is_terminal() {
            return vec![];
        }

        let detected = !self.matched && self.prompt.test(chunk);
        if detected {
            self.matched = true;
        }

        let mut actions = Vec::new();
        if let Some(visible) = self.gate.feed(chunk) {
            actions.push(Action::Forward(visible.to_string()));
        }
        if detected {
            info!(pattern = %self.prompt.as_str(), "matched 2FA code pattern");
            self.state = SessionState::AwaitingCode;
            let budget = self.deadline.saturating_duration_since(now) / 2;
            actions.push(Action::RequestCode { budget });
        }
        actions
    }

    /// The relay finished.
    pub fn on_code(&mut self, result: Result<String, SessionError>) -> Vec<Action> {
        if self.state != SessionState::AwaitingCode {
            return vec![];
        }
        match result {
            Ok(code) => {
                self.state = SessionState::Injecting;
                self.gate.mute(code.clone());
                vec![Action::Inject(code)]
            }
            Err(error) => self.fail(error),
        }
    }

    /// The code was written to the process.
    pub fn on_injected(&mut self) {
        if self.state == SessionState::Injecting {
            self.state = SessionState::Running;
        }
    }

    pub fn on_inject_failed(&mut self, error: SessionError) -> Vec<Action> {
        self.fail(error)
    }

    pub fn on_exit(&mut self, code: u32) {
        let outcome = if code == 0 {
            Outcome::Success(format!("Publish command process exited with exit code '{code}'"))
        } else {
            Outcome::Failure(SessionError::ProcessExit { code })
        };
        if !self.finish(outcome) {
            debug!(code, "ignoring exit after session already resolved");
        }
    }

    pub fn on_deadline(&mut self, now: Instant) -> Vec<Action> {
        if now < self.deadline {
            return vec![];
        }
        self.fail(SessionError::Timeout {
            budget: self.timeout,
        })
    }

    pub fn on_interrupt(&mut self) -> Vec<Action> {
        self.fail(SessionError::Interrupted)
    }

    fn fail(&mut self, error: SessionError) -> Vec<Action> {
        if self.finish(Outcome::Failure(error)) {
            vec![Action::Kill]
        } else {
            vec![]
        }
    }

    /// Set the outcome once; later attempts are no-ops.
    fn finish(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.state = if outcome.is_success() {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };
        self.outcome = Some(outcome);
        true
    }
}

/// Configuration for the orchestrator.
pub struct OrchestratorConfig {
    pub publish: SpawnConfig,
    pub code_pattern: CodePrompt,
    /// Global session budget.
    pub timeout: Duration,
    /// Revert command run on failure.
    pub revert: Option<SpawnConfig>,
    pub revert_timeout: Duration,
    pub pty_size: PtySize,
    /// Upper bound on how long the driver sleeps between checks of the
    /// deadline and the interrupt flag.
    pub tick: Duration,
}

impl OrchestratorConfig {
    pub fn default_tick() -> Duration {
        Duration::from_millis(200)
    }

    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            publish: config.publish.spawn_config(),
            code_pattern: config.code_pattern.clone(),
            timeout: config.timeout,
            revert: config.revert.as_ref().map(|r| r.spawn_config()),
            revert_timeout: config.revert_timeout(),
            pty_size: supervisor::default_pty_size(),
            tick: Self::default_tick(),
        }
    }
}

enum SessionEvent {
    Process(ProcessEvent),
    Code(Result<String, SessionError>),
}

impl From<ProcessEvent> for SessionEvent {
    fn from(event: ProcessEvent) -> Self {
        Self::Process(event)
    }
}

/// Run one full session: supervise, report, revert on failure.
///
/// `stop` is checked at least every `config.tick`; setting it interrupts
/// the session. Output of the publish and revert commands goes to `out`.
pub fn run(
    config: &OrchestratorConfig,
    relay: &CodeRelay,
    log: Option<&ExecutionLog>,
    stop: Arc<AtomicBool>,
    out: &mut dyn Write,
) -> Outcome {
    let record = |event: LogEvent| {
        if let Some(log) = log {
            log.record(event);
        }
    };

    record(LogEvent::SessionStarted {
        program: config.publish.program.clone(),
        args: config.publish.args.len(),
        timeout_ms: millis(config.timeout),
    });

    let outcome = supervise(config, relay, &record, &stop, out);
    match &outcome {
        Outcome::Success(message) => info!(%message, "publish succeeded"),
        Outcome::Failure(error) => warn!(kind = ?error.kind(), %error, "publish failed"),
    }

    channel::post_final_status(relay.channel(), &outcome.message());

    if let (Outcome::Failure(_), Some(spawn)) = (&outcome, &config.revert) {
        let revert = RevertExecutor::new(spawn.clone(), config.revert_timeout);
        record(LogEvent::RevertStarted {
            program: revert.program().to_string(),
        });
        let result = revert.run_logged(out);
        record(LogEvent::RevertFinished {
            success: result.is_ok(),
            detail: match &result {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
        });
    }

    record(LogEvent::SessionEnded {
        success: outcome.is_success(),
        message: outcome.message(),
    });
    outcome
}

fn supervise(
    config: &OrchestratorConfig,
    relay: &CodeRelay,
    record: &dyn Fn(LogEvent),
    stop: &AtomicBool,
    out: &mut dyn Write,
) -> Outcome {
    let (tx, rx) = mpsc::channel::<SessionEvent>();

    // Killed on drop, so every return below releases the process.
    let mut process = match supervisor::spawn(&config.publish, config.pty_size, tx.clone()) {
        Ok(process) => process,
        Err(e) => return Outcome::Failure(SessionError::Spawn(format!("{e:#}"))),
    };
    let mut session = Session::new(config.code_pattern.clone(), config.timeout, Instant::now());
    // Dropping the sender cancels an in-flight relay.
    let mut relay_cancel: Option<mpsc::Sender<()>> = None;

    let outcome = loop {
        if let Some(outcome) = session.outcome() {
            break outcome.clone();
        }

        let now = Instant::now();
        let actions = if stop.load(Ordering::Relaxed) {
            info!("interrupted, stopping publish command");
            session.on_interrupt()
        } else if now >= session.deadline() {
            warn!(timeout_ms = millis(config.timeout), "publish command timed out");
            record(LogEvent::SessionTimedOut {
                budget_ms: millis(config.timeout),
            });
            session.on_deadline(now)
        } else {
            let wait = session.deadline().saturating_duration_since(now).min(config.tick);
            match rx.recv_timeout(wait) {
                Ok(SessionEvent::Process(ProcessEvent::Output(chunk))) => {
                    session.on_output(&chunk, Instant::now())
                }
                Ok(SessionEvent::Process(ProcessEvent::Exited(code))) => {
                    record(LogEvent::ProcessExited { code });
                    session.on_exit(code);
                    vec![]
                }
                Ok(SessionEvent::Code(result)) => {
                    if let Err(e) = &result {
                        record(LogEvent::RelayFailed {
                            reason: e.to_string(),
                        });
                    }
                    session.on_code(result)
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => vec![],
            }
        };

        let mut pending: VecDeque<Action> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Forward(text) => {
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                }
                Action::RequestCode { budget } => {
                    record(LogEvent::PromptDetected {
                        pattern: config.code_pattern.as_str().to_string(),
                    });
                    record(LogEvent::CodeRequested {
                        budget_ms: millis(budget),
                    });
                    relay_cancel = Some(start_relay(relay, budget, tx.clone()));
                }
                Action::Inject(code) => {
                    info!("sending 2FA code to publish command");
                    match process.write_line(&code) {
                        Ok(()) => {
                            record(LogEvent::CodeInjected { length: code.len() });
                            session.on_injected();
                        }
                        Err(e) => {
                            pending.extend(session.on_inject_failed(SessionError::Inject(e.to_string())))
                        }
                    }
                }
                Action::Kill => process.kill(),
            }
        }
    };

    if let Some(cancel) = relay_cancel.take() {
        let _ = cancel.send(());
    }
    outcome
}

/// Run the relay on its own thread; its result comes back as an event.
fn start_relay(
    relay: &CodeRelay,
    budget: Duration,
    events: mpsc::Sender<SessionEvent>,
) -> mpsc::Sender<()> {
    let (cancel_tx, cancel_rx) = mpsc::channel();
    let relay = relay.clone();
    thread::spawn(move || match relay.request_code(budget, &cancel_rx) {
        Ok(Some(code)) => {
            let _ = events.send(SessionEvent::Code(Ok(code)));
        }
        Ok(None) => {}
        Err(e) => {
            let _ = events.send(SessionEvent::Code(Err(e)));
        }
    });
    cancel_tx
}
