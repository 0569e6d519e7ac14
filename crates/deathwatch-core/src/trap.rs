//! Fault and signal traps.
//!
//! [`TrapLayer::handle`] maps a lifecycle event to its ordered side effects
//! and returns what the caller should do next; it never exits the process
//! itself. The runtime glue ([`install_panic_hook`] and
//! [`spawn_signal_listener`]) is what actually terminates.
//!
//! | Event | Effects | Disposition |
//! |---|---|---|
//! | uncaught fault | death note, `SNAPSHOT`, `FATAL` | exit 1 |
//! | unhandled rejection | `SNAPSHOT`, `ERROR` | continue |
//! | `SIGTERM` / `SIGINT` / `SIGABRT` | death note, `SNAPSHOT` | exit 0 |
//! | normal exit | `INFO` with the code | exit with that code |
//!
//! The lifecycle moves `RUNNING -> TERMINATING -> TERMINATED`. Only the first
//! fault or signal runs its sequence; later ones are logged and ignored so the
//! first death note is never overwritten.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::death_note::{DeathNote, DeathNoteStore, ErrorInfo};
use crate::error::{Error, Result};
use crate::journal::Level;
use crate::snapshot::SnapshotCollector;

/// Snapshot and death-note reason for a panic.
pub const UNCAUGHT_EXCEPTION: &str = "UNCAUGHT_EXCEPTION";
/// Snapshot reason for a failed supervised task.
pub const UNHANDLED_REJECTION: &str = "UNHANDLED_REJECTION";

/// Exit status after an uncaught fault.
pub const FAULT_EXIT_CODE: i32 = 1;
/// Exit status after a trapped signal.
pub const SIGNAL_EXIT_CODE: i32 = 0;

const MAX_BACKTRACE_LEN: usize = 16 * 1024;

/// Termination signals the guardian traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapSignal {
    Term,
    Int,
    Abrt,
}

impl TrapSignal {
    pub const ALL: [Self; 3] = [Self::Term, Self::Int, Self::Abrt];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Abrt => "SIGABRT",
        }
    }

    /// `SIGNAL_<name>`, used as death-note and snapshot reason.
    #[must_use]
    pub fn reason(self) -> String {
        format!("SIGNAL_{}", self.name())
    }

    #[cfg(unix)]
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use nix::sys::signal::Signal;
        use tokio::signal::unix::SignalKind;
        match self {
            Self::Term => SignalKind::terminate(),
            Self::Int => SignalKind::interrupt(),
            Self::Abrt => SignalKind::from_raw(Signal::SIGABRT as i32),
        }
    }
}

impl std::fmt::Display for TrapSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A process lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapEvent {
    UncaughtFault {
        message: String,
        stack: Option<String>,
    },
    UnhandledRejection {
        reason: String,
    },
    Signal(TrapSignal),
    Exit {
        code: i32,
    },
}

/// What the caller should do after [`TrapLayer::handle`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep running.
    Continue,
    /// Terminate with this status.
    Exit(i32),
    /// Another terminal event is already being handled; do nothing.
    AlreadyTerminating,
}

/// Process lifecycle as seen by the trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Terminating = 1,
    Terminated = 2,
}

impl LifecycleState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

/// Orchestrates snapshot, death note and log for terminal events.
pub struct TrapLayer {
    state: AtomicU8,
    collector: SnapshotCollector,
    death_notes: Arc<DeathNoteStore>,
}

impl TrapLayer {
    pub fn new(collector: SnapshotCollector, death_notes: Arc<DeathNoteStore>) -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Running as u8),
            collector,
            death_notes,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Run the action sequence for `event`. Total: never panics on storage
    /// faults and never exits.
    pub fn handle(&self, event: TrapEvent) -> Disposition {
        match event {
            TrapEvent::UncaughtFault { message, stack } => {
                if !self.begin_terminating(UNCAUGHT_EXCEPTION) {
                    return Disposition::AlreadyTerminating;
                }
                let error = ErrorInfo {
                    message: message.clone(),
                    stack: stack.clone(),
                };
                self.write_death_note(UNCAUGHT_EXCEPTION, Some(error), false);
                self.collector.capture(UNCAUGHT_EXCEPTION, Some(&message));
                let text = match &stack {
                    Some(stack) => format!("{message}\n{stack}"),
                    None => message.clone(),
                };
                self.collector.log().log(
                    Level::Fatal,
                    text,
                    json!({ "message": message, "stack": stack }),
                );
                self.finish();
                Disposition::Exit(FAULT_EXIT_CODE)
            }
            TrapEvent::UnhandledRejection { reason } => {
                self.collector.capture(UNHANDLED_REJECTION, Some(&reason));
                self.collector
                    .log()
                    .log(Level::Error, reason, json!({ "kind": UNHANDLED_REJECTION }));
                Disposition::Continue
            }
            TrapEvent::Signal(signal) => {
                let reason = signal.reason();
                if !self.begin_terminating(&reason) {
                    return Disposition::AlreadyTerminating;
                }
                self.write_death_note(&reason, None, true);
                self.collector.capture(&reason, None);
                self.finish();
                Disposition::Exit(SIGNAL_EXIT_CODE)
            }
            TrapEvent::Exit { code } => {
                self.collector
                    .log()
                    .log(Level::Info, format!("process exiting with code {code}"), json!({ "code": code }));
                self.finish();
                Disposition::Exit(code)
            }
        }
    }

    /// Record the exit and terminate the process.
    pub fn terminate(&self, code: i32) -> ! {
        self.handle(TrapEvent::Exit { code });
        std::process::exit(code)
    }

    fn write_death_note(&self, reason: &str, error: Option<ErrorInfo>, graceful: bool) -> bool {
        let note = DeathNote::new(reason, error, self.collector.collect(), graceful);
        self.death_notes.write(&note)
    }

    /// `RUNNING -> TERMINATING`. Returns `false` if another terminal event
    /// got there first.
    fn begin_terminating(&self, reason: &str) -> bool {
        let won = self
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::Terminating as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !won {
            self.collector.log().log(
                Level::Warn,
                format!("{reason} ignored: process already terminating"),
                json!({ "state": format!("{:?}", self.state()) }),
            );
        }
        won
    }

    fn finish(&self) {
        self.state
            .store(LifecycleState::Terminated as u8, Ordering::SeqCst);
    }
}

/// Route panics to the trap layer, then exit with status 1.
///
/// Replaces any previously installed hook.
pub fn install_panic_hook(layer: Arc<TrapLayer>) {
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture().to_string();

        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

        match &location {
            Some(loc) => eprintln!("deathwatch: panic at {loc}: {message}"),
            None => eprintln!("deathwatch: panic: {message}"),
        }

        let mut stack = match &location {
            Some(loc) => format!("panicked at {loc}\n{backtrace}"),
            None => backtrace,
        };
        if stack.len() > MAX_BACKTRACE_LEN {
            let mut cut = MAX_BACKTRACE_LEN;
            while !stack.is_char_boundary(cut) {
                cut -= 1;
            }
            stack.truncate(cut);
            stack.push_str("\n... [truncated]");
        }

        let event = TrapEvent::UncaughtFault {
            message,
            stack: Some(stack),
        };
        if let Disposition::Exit(code) = layer.handle(event) {
            layer.terminate(code);
        }
    }));
}

/// Listen for `SIGTERM`, `SIGINT` and `SIGABRT` and route the first one to
/// the trap layer, then exit with status 0.
#[cfg(unix)]
pub fn spawn_signal_listener(layer: Arc<TrapLayer>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::signal;

    let register = |sig: TrapSignal| {
        signal(sig.kind())
            .map_err(|e| Error::Signal(format!("failed to register {sig} handler: {e}")))
    };
    let mut term = register(TrapSignal::Term)?;
    let mut int = register(TrapSignal::Int)?;
    let mut abrt = register(TrapSignal::Abrt)?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = term.recv() => TrapSignal::Term,
                Some(()) = int.recv() => TrapSignal::Int,
                Some(()) = abrt.recv() => TrapSignal::Abrt,
                else => break,
            };
            debug!(signal = %received, "Signal received");
            if let Disposition::Exit(code) = layer.handle(TrapEvent::Signal(received)) {
                layer.terminate(code);
            }
        }
    }))
}

/// Non-unix fallback: only Ctrl-C is observable.
#[cfg(not(unix))]
pub fn spawn_signal_listener(layer: Arc<TrapLayer>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if let Disposition::Exit(code) = layer.handle(TrapEvent::Signal(TrapSignal::Int)) {
                layer.terminate(code);
            }
        }
    }))
}
