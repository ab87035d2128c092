//! Command line entry point: supervise one app of a JSON process file.

use std::{io, path::PathBuf, process::ExitCode};

use anyhow::Context;
use app_supervisor::{AppSpec, SupervisorBuilder, SupervisorHandle};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for an unusable configuration (EX_CONFIG).
const CONFIG_ERROR_EXIT_CODE: u8 = 78;

/// Keeps one application process alive, with restart policies and log rotation
#[derive(Parser)]
#[command(name = "app-supervisor", version)]
struct Args {
    /// Process file: `{"apps": [...]}` or a single app object
    config: PathBuf,

    /// App to run when the process file declares several
    #[arg(long)]
    app: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let spec = match AppSpec::load(&args.config, args.app.as_deref()) {
        Ok(spec) => spec,
        Err(err) => {
            error!(config = %args.config.display(), "{err}");
            return Ok(ExitCode::from(CONFIG_ERROR_EXIT_CODE));
        }
    };
    info!(app = %spec.name, script = %spec.script, "supervising");

    let signals = Signals::install().context("failed to install signal handlers")?;
    let supervisor = SupervisorBuilder::new(spec).build().run();
    let signals = tokio::spawn(signals.forward(supervisor.clone()));

    let reason = supervisor
        .wait()
        .await
        .context("supervisor stopped unexpectedly")?;
    signals.abort();

    info!(%reason, "exiting");
    Ok(ExitCode::from(reason.exit_code()))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Signal streams, registered before the child is launched so no early
/// signal falls back to the default disposition.
struct Signals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    user1: Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Maps termination signals to a graceful shutdown and SIGUSR1 to a
    /// status dump.
    async fn forward(mut self, supervisor: SupervisorHandle) {
        loop {
            tokio::select! {
                _ = self.interrupt.recv() => request_shutdown(&supervisor, "SIGINT"),
                _ = self.terminate.recv() => request_shutdown(&supervisor, "SIGTERM"),
                _ = self.quit.recv() => request_shutdown(&supervisor, "SIGQUIT"),
                _ = self.user1.recv() => dump_status(&supervisor),
            }
        }
    }
}

fn dump_status(supervisor: &SupervisorHandle) {
    match serde_json::to_string(&supervisor.status()) {
        Ok(json) => {
            info!(status = %json, "status requested");
            println!("{json}");
        }
        Err(err) => error!("failed to serialize status: {err}"),
    }
}

fn request_shutdown(supervisor: &SupervisorHandle, signal: &str) {
    info!(signal, "received termination signal");
    if let Err(err) = supervisor.shutdown() {
        warn!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use app_supervisor::ExitReason;
    use nix::sys::signal::{raise, Signal as Kill};
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn installed_handlers_turn_sigterm_into_shutdown() {
        let spec = AppSpec::from_json(
            r#"{"name": "sleeper", "script": "sh", "args": ["-c", "sleep 30"],
                "out_file": "/dev/null", "error_file": "/dev/null"}"#,
            None,
        )
        .unwrap();
        let signals = Signals::install().unwrap();
        let supervisor = SupervisorBuilder::new(spec).build().run();
        let forwarding = tokio::spawn(signals.forward(supervisor.clone()));

        timeout(
            Duration::from_secs(5),
            supervisor.wait_until(|status| status.pid.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        raise(Kill::SIGTERM).unwrap();

        let reason = timeout(Duration::from_secs(10), supervisor.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::Shutdown);
        forwarding.abort();
    }
}
