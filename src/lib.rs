//! # app-supervisor
//!
//! `app-supervisor` keeps one application process alive.
//! It launches the configured command, writes its output to rotating log files,
//! and restarts it when it exits, until a restart policy says to stop.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use app_supervisor::{AppSpec, SupervisorBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec = AppSpec::load(Path::new("ecosystem.json"), Some("api"))?;
//!     let supervisor = SupervisorBuilder::new(spec).build().run();
//!
//!     let reason = supervisor.wait().await?; // clean exit, restart budget spent, shutdown...
//!     println!("supervisor stopped: {reason}");
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Restart policy**: stop exit codes, a bounded restart budget, a fixed restart delay,
//!   and a counter reset after a stable run.
//! * **Graceful stops**: a configurable kill signal sent to the whole process group,
//!   escalated to `SIGKILL` after a grace period.
//! * **Logs**: separate or merged stdout/stderr files, an optional combined log with
//!   lifecycle lines, timestamps and size-based rotation.
//! * **Memory limit**: the child is restarted when its resident memory exceeds a limit.
//!
//! ## API overview
//!
//! | SupervisorHandle method | Purpose                                                  |
//! | ----------------------- | -------------------------------------------------------- |
//! | `status()`              | Snapshot of phase, pid, restart counter and last exit    |
//! | `shutdown()`            | Stop the child and exit without restarting               |
//! | `wait().await`          | Resolve to the terminal `ExitReason`                     |
//! | `wait_until(f).await`   | Resolve to the first status matching `f`                 |

pub use config::{
    parse_duration, parse_signal, parse_size, AppConfig, AppSpec, ConfigError, LogSettings,
};
pub use logs::{
    pump_lines, DateFormat, LogRecord, LogSender, LogSink, LogWriteError, LogWriter,
    LogWriterHandle, StreamId, OUTPUT_QUEUE_LIMIT,
};
pub use nix::sys::signal::Signal;
pub use policy::{Decision, RestartPolicy};
pub use process::{
    resident_set_size, ChildProcess, CommandLauncher, ExitInfo, LaunchError, Launcher,
    OutputStream, ProcessHandle, LAUNCH_FAILURE_EXIT_CODE,
};
pub use state::{ExitReason, Phase, RunState, StopCause, SupervisorStatus};
pub use supervisor::{
    builder::SupervisorBuilder,
    handle::{SupervisorHandle, SupervisorHandleError},
    Supervisor, SupervisorError,
};

mod config;
mod logs;
mod policy;
mod process;
mod state;
mod supervisor;
