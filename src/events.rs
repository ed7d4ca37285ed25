//! Event definitions shared by processes, behaviors and the completion listener.
//!
//! This module defines the signals corun can send or receive (`ProcessSignal`),
//! the way a process ended (`ExitCode`), and the immutable records emitted when a
//! process closes (`CloseEvent`) or starts/stops its timer (`TimerEvent`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Local};

use crate::process::ProcessSpec;

/// Signals that can be forwarded to processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigHup,
    SigKill,
}

impl ProcessSignal {
    /// The conventional signal name, e.g. `SIGTERM`.
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigHup => "SIGHUP",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ProcessSignal {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "INT" => Ok(ProcessSignal::SigInt),
            "TERM" => Ok(ProcessSignal::SigTerm),
            "HUP" => Ok(ProcessSignal::SigHup),
            "KILL" => Ok(ProcessSignal::SigKill),
            _ => Err(anyhow!("unsupported signal: {}", value)),
        }
    }
}

/// How a process ended: a numeric exit code or the name of the terminating signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCode {
    Code(i32),
    Signal(String),
}

impl ExitCode {
    /// Builds an exit code from a raw close notification.
    ///
    /// A close without a numeric code is signal-driven; when the signal is unknown as
    /// well the exit code is the signal `null`.
    pub fn from_parts(code: Option<i32>, signal: Option<String>) -> Self {
        match code {
            Some(code) => ExitCode::Code(code),
            None => ExitCode::Signal(signal.unwrap_or_else(|| "null".to_string())),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Code(0))
    }

    pub fn is_signal(&self, signal: ProcessSignal) -> bool {
        matches!(self, ExitCode::Signal(name) if name == signal.label())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Code(code) => write!(f, "{}", code),
            ExitCode::Signal(signal) => f.write_str(signal),
        }
    }
}

/// Start/end instants of one spawn of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    pub start_date: DateTime<Local>,
    pub end_date: DateTime<Local>,
    pub duration: Duration,
}

/// Immutable record describing how and when a process terminated.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseEvent {
    /// Snapshot of the process identity, captured when it was spawned.
    pub command: ProcessSpec,
    /// The process's position in the original command list.
    pub index: usize,
    /// Whether corun requested the termination of this spawn.
    pub killed: bool,
    pub exit_code: ExitCode,
    pub timings: Timings,
}

/// Emitted once when a process starts, and again (with `end_date`) when it stops.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEvent {
    pub start_date: DateTime<Local>,
    pub end_date: Option<DateTime<Local>>,
}
