//! Launching and controlling the supervised child.
//!
//! [`Launcher`] and [`ChildProcess`] are the seams the supervisor talks to;
//! [`CommandLauncher`] and [`ProcessHandle`] implement them on top of
//! `tokio::process`.

mod memory;

use std::{fmt, io, os::unix::process::ExitStatusExt, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
};

use crate::config::AppSpec;

pub use memory::resident_set_size;

/// Exit code recorded when the child could not be launched at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -1;

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// How a child run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Number of the signal that terminated the process.
    pub signal: Option<i32>,
    pub launch_failed: bool,
    /// The supervisor stopped this run to replace it, e.g. over the memory limit.
    pub stopped_by_supervisor: bool,
}

impl ExitInfo {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            launch_failed: false,
            stopped_by_supervisor: false,
        }
    }

    pub fn killed(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
            launch_failed: false,
            stopped_by_supervisor: false,
        }
    }

    pub fn launch_failure() -> Self {
        Self {
            code: Some(LAUNCH_FAILURE_EXIT_CODE),
            signal: None,
            launch_failed: true,
            stopped_by_supervisor: false,
        }
    }

    /// The exit status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            launch_failed: false,
            stopped_by_supervisor: false,
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            launch_failed: false,
            stopped_by_supervisor: false,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.launch_failed {
            return write!(f, "failed to launch");
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(number)) => match Signal::try_from(number) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {number}"),
            },
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable `{program}` not found")]
    ExecutableNotFound { program: String },
    #[error("working directory {} does not exist or is not a directory", path.display())]
    InvalidWorkingDirectory { path: PathBuf },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A running child as seen by the supervisor.
#[async_trait]
pub trait ChildProcess: Send + 'static {
    /// OS process id, `None` once the process has been reaped.
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<OutputStream>;

    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Waits for the process to exit.
    ///
    /// Must be cancel-safe: dropping the future and calling `wait` again
    /// keeps waiting on the same process.
    async fn wait(&mut self) -> io::Result<ExitInfo>;

    /// Delivers `signal`. Signalling a process that already exited is not an
    /// error.
    fn signal(&mut self, signal: Signal) -> io::Result<()>;

    /// Resident memory in bytes, if it can be measured.
    fn memory_usage(&self) -> Option<u64>;
}

/// Creates child processes for an [`AppSpec`].
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, spec: &AppSpec) -> Result<Box<dyn ChildProcess>, LaunchError>;
}

/// Spawns the configured command as an OS process.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &AppSpec) -> Result<Box<dyn ChildProcess>, LaunchError> {
        Ok(Box::new(ProcessHandle::spawn(spec)?))
    }
}

/// An OS child process with piped stdout/stderr.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    process_group: bool,
}

impl ProcessHandle {
    /// Spawns `spec.script` with its arguments, working directory and the
    /// inherited environment overridden by `spec.env`.
    ///
    /// With `treekill` the child leads a new process group, and signals are
    /// sent to the whole group.
    pub fn spawn(spec: &AppSpec) -> Result<Self, LaunchError> {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(LaunchError::InvalidWorkingDirectory { path: cwd.clone() });
            }
        }

        let mut command = Command::new(&spec.script);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if spec.treekill {
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LaunchError::ExecutableNotFound {
                program: spec.script.clone(),
            },
            _ => LaunchError::Spawn {
                program: spec.script.clone(),
                source,
            },
        })?;

        Ok(Self {
            pid: child.id(),
            child,
            process_group: spec.treekill,
        })
    }
}

#[async_trait]
impl ChildProcess for ProcessHandle {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as OutputStream)
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo::from_status(status))
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // A reaped pid may already belong to someone else.
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let delivered = if self.process_group {
            signal::killpg(pid, signal)
        } else {
            signal::kill(pid, signal)
        };
        match delivered {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn memory_usage(&self) -> Option<u64> {
        self.pid.and_then(resident_set_size)
    }
}
