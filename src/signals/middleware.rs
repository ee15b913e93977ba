//! Signal middleware.
//!
//! At command entry, high-value commands surface unread signals on stderr so
//! an agent sees coordination messages before acting. Low-value commands
//! skip the check entirely; generic `wu:*` commands are throttled to once
//! per 30 s per command name. The whole middleware is fail-open: a broken
//! signals file or a hung remote must never block a command.
//!
//! The throttle map and the remote circuit are process-wide state, modelled
//! as an injected [`MiddlewareState`] so tests can drive time and failure
//! counts deterministically.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::EngineDefaults;

use super::{Signal, SignalBus, SignalFilter};

/// How a command name relates to the signal check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Always check.
    HighValue,
    /// Check at most once per throttle window per command name.
    Generic,
    /// Never check.
    LowValue,
}

/// Classify a command name.
pub fn classify_command(name: &str) -> CommandClass {
    const HIGH_VALUE: &[&str] = &[
        "wu:claim",
        "wu:create",
        "wu:prep",
        "wu:done",
        "wu:status",
        "wu:recover",
        "wu:release",
    ];
    if HIGH_VALUE.contains(&name) {
        return CommandClass::HighValue;
    }
    if name.starts_with("mem:") || name.starts_with("file:") || name.starts_with("git:") {
        return CommandClass::LowValue;
    }
    if name.starts_with("wu:") {
        return CommandClass::Generic;
    }
    CommandClass::LowValue
}

/// Remote pull hook: fetches signals from an external plane. Implementations
/// must be cheap to call; the middleware enforces the deadline.
pub trait RemotePull: Send + Sync {
    fn pull(&self) -> Result<Vec<Signal>, String>;
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Process-wide middleware state.
#[derive(Debug)]
pub struct MiddlewareState {
    defaults: EngineDefaults,
    /// Last check time per generic command name.
    throttle: DashMap<String, Instant>,
    circuit: Mutex<CircuitState>,
}

impl MiddlewareState {
    pub fn init(defaults: EngineDefaults) -> Self {
        Self {
            defaults,
            throttle: DashMap::new(),
            circuit: Mutex::new(CircuitState::default()),
        }
    }

    /// Drop all throttle entries and close the circuit.
    pub fn reset(&self) {
        self.throttle.clear();
        *self.circuit.lock().expect("circuit lock") = CircuitState::default();
    }

    fn throttled(&self, command: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.throttle.get(command) {
            if now.duration_since(*last) < self.defaults.generic_check_throttle {
                return true;
            }
        }
        self.throttle.insert(command.to_string(), now);
        false
    }

    fn circuit_open(&self) -> bool {
        let mut circuit = self.circuit.lock().expect("circuit lock");
        match circuit.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Half-open: allow one attempt
                circuit.open_until = None;
                false
            }
            None => false,
        }
    }

    fn record_remote_failure(&self) {
        let mut circuit = self.circuit.lock().expect("circuit lock");
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= self.defaults.remote_circuit_failure_threshold {
            circuit.open_until = Some(Instant::now() + self.defaults.remote_circuit_open);
            log::debug!(
                "remote signal circuit open after {} failures",
                circuit.consecutive_failures
            );
        }
    }

    fn record_remote_success(&self) {
        let mut circuit = self.circuit.lock().expect("circuit lock");
        circuit.consecutive_failures = 0;
        circuit.open_until = None;
    }

    #[cfg(test)]
    fn force_throttle(&self, command: &str, at: Instant) {
        self.throttle.insert(command.to_string(), at);
    }
}

/// What the middleware did for one command entry.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MiddlewareOutcome {
    pub checked: bool,
    /// Summary line for stderr; `None` when nothing unread or not checked.
    pub summary: Option<String>,
    pub remote_pulled: bool,
}

fn summarize(unread: &[Signal]) -> Option<String> {
    if unread.is_empty() {
        return None;
    }
    let preview = unread
        .iter()
        .rev()
        .take(3)
        .map(|s| {
            let scope = s
                .wu_id
                .map(|id| id.to_string())
                .or_else(|| s.lane.clone())
                .unwrap_or_else(|| "general".to_string());
            format!("[{scope}] {}", s.message)
        })
        .collect::<Vec<_>>()
        .join("; ");
    Some(format!("{} unread signal(s): {preview}", unread.len()))
}

/// Race the remote pull against the configured deadline. The losing side is
/// abandoned: the detached thread finishes in the background and its result
/// is dropped with the channel.
fn pull_with_deadline(
    remote: Arc<dyn RemotePull>,
    timeout: Duration,
) -> Result<Vec<Signal>, String> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(remote.pull());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err("remote pull timed out".to_string()),
    }
}

/// Run the middleware for one command. Fail-open: every internal error is
/// swallowed into an unchecked/empty outcome.
pub fn check_signals(
    bus: &SignalBus,
    state: &MiddlewareState,
    command: &str,
    remote: Option<Arc<dyn RemotePull>>,
) -> MiddlewareOutcome {
    match classify_command(command) {
        CommandClass::LowValue => return MiddlewareOutcome::default(),
        CommandClass::Generic => {
            if state.throttled(command) {
                return MiddlewareOutcome::default();
            }
        }
        CommandClass::HighValue => {}
    }

    let mut outcome = MiddlewareOutcome {
        checked: true,
        ..Default::default()
    };

    if let Some(remote) = remote {
        if !state.circuit_open() {
            match pull_with_deadline(Arc::clone(&remote), state.defaults.remote_pull_timeout) {
                Ok(pulled) => {
                    state.record_remote_success();
                    outcome.remote_pulled = true;
                    for signal in pulled {
                        // Remote signals are merged best-effort
                        let _ = bus.create_signal(super::NewSignal {
                            message: signal.message,
                            wu_id: signal.wu_id,
                            lane: signal.lane,
                            kind: signal.kind,
                            sender: signal.sender,
                            target_agent: signal.target_agent,
                            origin: Some("remote".to_string()),
                            remote_id: signal.remote_id.or(Some(signal.id)),
                        });
                    }
                }
                Err(e) => {
                    state.record_remote_failure();
                    log::debug!("remote signal pull failed: {e}");
                }
            }
        }
    }

    match bus.load_signals(&SignalFilter {
        unread_only: true,
        ..Default::default()
    }) {
        Ok(unread) => outcome.summary = summarize(&unread),
        Err(e) => log::debug!("signal check failed open: {e}"),
    }

    outcome
}
