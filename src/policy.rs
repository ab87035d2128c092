//! Restart decisions.
//!
//! [`RestartPolicy::decide`] is a pure function of the run bookkeeping and the
//! observed exit. Rules are applied in order:
//!
//! 1. exit code in `stop_exit_codes` → stop, clean exit (even with autorestart off),
//!    unless the supervisor itself stopped the run;
//! 2. autorestart disabled → stop;
//! 3. restart budget spent → stop;
//! 4. otherwise restart after `restart_delay`.
//!
//! The caller increments the restart counter when it acts on a restart, and
//! resets it when the previous run was [stable](RestartPolicy::is_stable).

use std::{collections::BTreeSet, time::Duration};

use crate::{
    config::AppSpec,
    process::ExitInfo,
    state::{ExitReason, RunState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Restart { after: Duration },
    Stop(ExitReason),
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub autorestart: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub min_uptime: Duration,
    pub stop_exit_codes: BTreeSet<i32>,
}

impl RestartPolicy {
    pub fn from_spec(spec: &AppSpec) -> Self {
        Self {
            autorestart: spec.autorestart,
            max_restarts: spec.max_restarts,
            restart_delay: spec.restart_delay,
            min_uptime: spec.min_uptime,
            stop_exit_codes: spec.stop_exit_codes.clone(),
        }
    }

    pub fn decide(&self, state: &RunState, exit: &ExitInfo) -> Decision {
        if self.is_clean_exit(exit) {
            return Decision::Stop(ExitReason::CleanExit);
        }
        if !self.autorestart {
            return Decision::Stop(ExitReason::AutorestartDisabled);
        }
        if state.restart_counter >= self.max_restarts {
            return Decision::Stop(ExitReason::MaxRestartsExceeded);
        }
        Decision::Restart {
            after: self.restart_delay,
        }
    }

    /// Launch failures and runs stopped by the supervisor never count as
    /// clean, whatever their exit code.
    pub fn is_clean_exit(&self, exit: &ExitInfo) -> bool {
        !exit.launch_failed
            && !exit.stopped_by_supervisor
            && exit
                .code
                .is_some_and(|code| self.stop_exit_codes.contains(&code))
    }

    /// A run of at least `min_uptime` wipes the restart counter.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.min_uptime
    }
}
