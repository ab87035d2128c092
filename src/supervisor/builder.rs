use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::{
    config::AppSpec,
    logs::LogWriterHandle,
    policy::RestartPolicy,
    process::{CommandLauncher, Launcher},
    state::{RunState, SupervisorStatus},
    Supervisor,
};

/// Builds a [`Supervisor`] for one application.
///
/// By default children are real OS processes spawned by [`CommandLauncher`].
pub struct SupervisorBuilder {
    spec: AppSpec,
    launcher: Arc<dyn Launcher>,
}

impl SupervisorBuilder {
    pub fn new(spec: AppSpec) -> Self {
        Self {
            spec,
            launcher: Arc::new(CommandLauncher),
        }
    }

    /// Replaces the way children are created.
    pub fn with_launcher(mut self, launcher: impl Launcher) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn build(self) -> Supervisor {
        let spec = Arc::new(self.spec);
        let state = RunState::default();
        let (status_tx, _) = watch::channel(SupervisorStatus::new(&spec.name, &state));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        Supervisor {
            policy: RestartPolicy::from_spec(&spec),
            spec,
            launcher: self.launcher,
            state,
            generation: 0,
            child: None,
            pending_restart: None,
            shutdown_requested: false,
            logs: LogWriterHandle::detached(),
            status_tx,
            internal_tx,
            internal_rx,
            external_tx: user_tx,
            external_rx: user_rx,
        }
    }
}
