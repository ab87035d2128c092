use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::process::ExitInfo;

/// Why the supervisor stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The child exited with one of the configured stop exit codes.
    CleanExit,
    AutorestartDisabled,
    MaxRestartsExceeded,
    Shutdown,
}

impl ExitReason {
    /// Process exit code of the supervisor for this outcome.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::CleanExit | Self::Shutdown => 0,
            Self::AutorestartDisabled => 1,
            Self::MaxRestartsExceeded => 2,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CleanExit => write!(f, "clean_exit"),
            Self::AutorestartDisabled => write!(f, "autorestart_disabled"),
            Self::MaxRestartsExceeded => write!(f, "max_restarts_exceeded"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Why a running child is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum StopCause {
    MemoryLimitExceeded { rss: u64, limit: u64 },
    ShutdownRequested,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryLimitExceeded { rss, limit } => {
                write!(f, "memory limit exceeded ({rss} > {limit} bytes)")
            }
            Self::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// Lifecycle phase of the supervised application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "detail", rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping(StopCause),
    /// Waiting out the restart delay.
    Restarting,
    Exited(ExitReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match self {
            Self::Exited(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping(cause) => write!(f, "stopping ({cause})"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited(reason) => write!(f, "exited ({reason})"),
        }
    }
}

/// Mutable run bookkeeping, owned by the supervisor loop.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub phase: Phase,
    pub pid: Option<u32>,
    pub restart_counter: u32,
    pub last_exit: Option<ExitInfo>,
    /// Failed log writes since the supervisor started. Never fatal.
    pub log_write_failures: u64,
    /// Start of the current run, for uptime.
    pub started_at: Option<Instant>,
    pub started_at_wall: Option<DateTime<Utc>>,
}

/// Point-in-time view of the supervisor, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub name: String,
    #[serde(flatten)]
    pub phase: Phase,
    pub pid: Option<u32>,
    pub restart_counter: u32,
    pub last_exit: Option<ExitInfo>,
    pub log_write_failures: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl SupervisorStatus {
    pub(crate) fn new(name: &str, state: &RunState) -> Self {
        Self {
            name: name.to_string(),
            phase: state.phase,
            pid: state.pid,
            restart_counter: state.restart_counter,
            last_exit: state.last_exit,
            log_write_failures: state.log_write_failures,
            started_at: state.started_at_wall,
        }
    }
}
