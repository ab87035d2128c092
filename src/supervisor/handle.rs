use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::{
    state::{ExitReason, Phase, SupervisorStatus},
    supervisor::SupervisorError,
};

/// Requests sent to the supervisor loop through a [`SupervisorHandle`].
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    Shutdown,
}

#[derive(Debug, Error)]
pub enum SupervisorHandleError {
    #[error("supervisor is no longer running")]
    Closed,
}

/// Cloneable control surface of a running [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SupervisorMessage>,
        status: watch::Receiver<SupervisorStatus>,
    ) -> Self {
        Self { tx, status }
    }

    /// Latest published status. Still available after the supervisor finished.
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    /// Asks the supervisor to stop the child and exit without restarting.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.tx
            .send(SupervisorMessage::Shutdown)
            .map_err(|_| SupervisorHandleError::Closed)
    }

    /// Waits until the supervisor reaches a terminal phase.
    ///
    /// Resolves after the logs were flushed. Can be awaited any number of
    /// times, from any number of clones.
    pub async fn wait(&self) -> Result<ExitReason, SupervisorError> {
        let status = self
            .wait_until(|status| status.phase.is_terminal())
            .await?;
        status.phase.exit_reason().ok_or(SupervisorError::Aborted)
    }

    /// Waits for the first published status satisfying `predicate`.
    ///
    /// Fails if the supervisor stops without ever publishing such a status.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<SupervisorStatus, SupervisorError>
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            if predicate(&current) {
                return Ok(current);
            }
            if status.changed().await.is_err() {
                let last = status.borrow().clone();
                return if predicate(&last) {
                    Ok(last)
                } else {
                    Err(SupervisorError::Aborted)
                };
            }
        }
    }
}
