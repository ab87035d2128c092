pub(crate) mod builder;
pub(crate) mod handle;

use std::{future, sync::Arc, time::Duration};

use chrono::Utc;
use handle::SupervisorMessage;
use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant, Interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AppSpec,
    logs::{pump_lines, LogRecord, LogWriteError, LogWriter, LogWriterHandle, StreamId},
    policy::{Decision, RestartPolicy},
    process::{ChildProcess, ExitInfo, Launcher},
    state::{ExitReason, Phase, RunState, StopCause, SupervisorStatus},
    supervisor::handle::SupervisorHandle,
};

/// How long output pumps may keep forwarding after the child exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor stopped without reaching a terminal state")]
    Aborted,
}

/// Internal events sent by auxiliary tasks to the supervisor loop.
///
/// Child-related events carry the launch generation they belong to; events of
/// a previous child are dropped.
#[derive(Debug)]
pub(crate) enum Event {
    Exited { generation: u64, exit: ExitInfo },
    MemorySample { generation: u64, rss: u64 },
    GraceExpired { generation: u64 },
    RestartDue { generation: u64 },
    LogWriteFailed(LogWriteError),
}

/// The live child, as far as the supervisor loop is concerned.
struct ChildSlot {
    generation: u64,
    signals: mpsc::UnboundedSender<Signal>,
    /// Cancels the watcher and the grace timer of this child.
    token: CancellationToken,
}

/// Keeps one application running.
///
/// The supervisor launches the child, forwards its output to the log files and
/// decides on every exit whether to restart it, following the configured
/// [`RestartPolicy`]. It stops for good once the policy says so or a shutdown
/// is requested through the [`SupervisorHandle`].
pub struct Supervisor {
    spec: Arc<AppSpec>,
    launcher: Arc<dyn Launcher>,
    policy: RestartPolicy,
    state: RunState,
    generation: u64,
    child: Option<ChildSlot>,
    pending_restart: Option<CancellationToken>,
    shutdown_requested: bool,
    logs: LogWriterHandle,
    status_tx: watch::Sender<SupervisorStatus>,
    internal_tx: mpsc::UnboundedSender<Event>,
    internal_rx: mpsc::UnboundedReceiver<Event>,
    external_tx: mpsc::UnboundedSender<SupervisorMessage>,
    external_rx: mpsc::UnboundedReceiver<SupervisorMessage>,
}

impl Supervisor {
    /// Runs the supervisor, consuming it and returning a handle for external control.
    pub fn run(self) -> SupervisorHandle {
        let handle = SupervisorHandle::new(self.external_tx.clone(), self.status_tx.subscribe());
        tokio::spawn(self.run_and_supervise());
        handle
    }

    async fn run_and_supervise(mut self) {
        self.start_logs();
        self.start_child().await;
        while !self.state.phase.is_terminal() {
            tokio::select! {
                Some(event) = self.internal_rx.recv() => {
                    self.handle_event(event).await;
                },
                Some(user_msg) = self.external_rx.recv() => {
                    self.handle_user_message(user_msg);
                },
                else => break,
            }
        }
        self.teardown().await;
    }

    fn start_logs(&mut self) {
        let writer = LogWriter::new(&self.spec.name, &self.spec.logs);
        let tx = self.internal_tx.clone();
        match LogWriterHandle::spawn(writer, move |err| {
            let _ = tx.send(Event::LogWriteFailed(err));
        }) {
            Ok(logs) => self.logs = logs,
            Err(err) => error!(
                app = %self.spec.name,
                "failed to start the log writer, output will be discarded: {err}"
            ),
        }
    }

    /// Launches a new child. A launch failure is handled like an exit.
    async fn start_child(&mut self) {
        self.generation += 1;
        self.state.pid = None;
        self.state.started_at = None;
        self.state.started_at_wall = None;
        self.transition(Phase::Starting);

        let launcher = Arc::clone(&self.launcher);
        let spec = Arc::clone(&self.spec);
        match launcher.launch(&spec).await {
            Ok(child) => self.attach(child),
            Err(err) => {
                error!(app = %self.spec.name, generation = self.generation, "launch failed: {err}");
                self.note(format!("launch failed: {err}"));
                self.on_exit(ExitInfo::launch_failure());
            }
        }
    }

    /// Wires a freshly launched child to the log writer and its watcher task.
    fn attach(&mut self, mut child: Box<dyn ChildProcess>) {
        let generation = self.generation;
        let pumps: Vec<_> = [
            (child.take_stdout(), StreamId::Stdout),
            (child.take_stderr(), StreamId::Stderr),
        ]
        .into_iter()
        .filter_map(|(reader, stream)| {
            reader.map(|reader| tokio::spawn(pump_lines(reader, stream, self.logs.sender())))
        })
        .collect();

        self.state.pid = child.id();
        self.state.started_at = Some(Instant::now());
        self.state.started_at_wall = Some(Utc::now());

        let token = CancellationToken::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let memory_check = self
            .spec
            .max_memory_restart
            .map(|_| self.spec.memory_check_interval);
        tokio::spawn(watch_child(
            generation,
            child,
            pumps,
            signals_rx,
            memory_check,
            token.clone(),
            self.internal_tx.clone(),
        ));
        self.child = Some(ChildSlot {
            generation,
            signals: signals_tx,
            token,
        });

        info!(app = %self.spec.name, pid = ?self.state.pid, generation, "child started");
        self.transition(Phase::Running);
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Exited { generation, exit } => {
                if !self.is_current(generation) {
                    debug!(generation, "ignoring exit of a previous child");
                    return;
                }
                if let Some(slot) = self.child.take() {
                    slot.token.cancel();
                }
                self.on_exit(exit);
            }
            Event::MemorySample { generation, rss } => {
                if self.is_current(generation) {
                    self.check_memory(rss);
                }
            }
            Event::GraceExpired { generation } => {
                if self.is_current(generation) && matches!(self.state.phase, Phase::Stopping(_)) {
                    self.force_kill();
                }
            }
            Event::RestartDue { generation } => {
                if generation == self.generation && self.state.phase == Phase::Restarting {
                    self.pending_restart = None;
                    self.start_child().await;
                }
            }
            Event::LogWriteFailed(err) => {
                self.state.log_write_failures += 1;
                warn!(
                    app = %self.spec.name,
                    failures = self.state.log_write_failures,
                    "{err}"
                );
                self.publish();
            }
        }
    }

    fn handle_user_message(&mut self, msg: SupervisorMessage) {
        match msg {
            SupervisorMessage::Shutdown => self.request_shutdown(),
        }
    }

    /// Records the exit of the current child and applies the restart policy.
    fn on_exit(&mut self, mut exit: ExitInfo) {
        if let Phase::Stopping(StopCause::MemoryLimitExceeded { .. }) = self.state.phase {
            exit.stopped_by_supervisor = true;
        }
        let uptime = self.state.started_at.take().map(|started| started.elapsed());
        self.state.pid = None;
        self.state.last_exit = Some(exit);
        info!(app = %self.spec.name, %exit, ?uptime, "child exited");
        self.note(format!("process {exit}"));

        if self.shutdown_requested {
            return self.finish(ExitReason::Shutdown);
        }
        let stable = uptime.is_some_and(|uptime| self.policy.is_stable(uptime));
        if stable && self.state.restart_counter > 0 {
            debug!(app = %self.spec.name, "run was stable, resetting restart counter");
            self.state.restart_counter = 0;
        }
        match self.policy.decide(&self.state, &exit) {
            Decision::Restart { after } => self.schedule_restart(after),
            Decision::Stop(reason) => self.finish(reason),
        }
    }

    fn schedule_restart(&mut self, after: Duration) {
        self.state.restart_counter = self.state.restart_counter.saturating_add(1);
        info!(
            app = %self.spec.name,
            restart = self.state.restart_counter,
            max_restarts = self.policy.max_restarts,
            delay = ?after,
            "scheduling restart"
        );
        self.transition(Phase::Restarting);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(after) => {
                    let _ = tx.send(Event::RestartDue { generation });
                }
            }
        });
        self.pending_restart = Some(token);
    }

    fn request_shutdown(&mut self) {
        if self.shutdown_requested || self.state.phase.is_terminal() {
            return;
        }
        self.shutdown_requested = true;
        info!(app = %self.spec.name, phase = %self.state.phase, "shutdown requested");
        match self.state.phase {
            Phase::Running => self.begin_stop(StopCause::ShutdownRequested),
            Phase::Stopping(_) => self.note("shutdown pending until the child exits"),
            Phase::Restarting => {
                if let Some(token) = self.pending_restart.take() {
                    token.cancel();
                }
                self.finish(ExitReason::Shutdown);
            }
            Phase::Idle | Phase::Starting => self.finish(ExitReason::Shutdown),
            Phase::Exited(_) => {}
        }
    }

    /// Sends the kill signal and arms the grace timer.
    fn begin_stop(&mut self, cause: StopCause) {
        let Some((generation, signals, token)) = self
            .child
            .as_ref()
            .map(|slot| (slot.generation, slot.signals.clone(), slot.token.clone()))
        else {
            return;
        };
        self.transition(Phase::Stopping(cause));

        let signal = self.spec.kill_signal;
        info!(app = %self.spec.name, signal = signal.as_str(), "stopping child");
        if signals.send(signal).is_err() {
            debug!(generation, "child watcher already finished");
        }

        let grace = self.spec.kill_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(grace) => {
                    let _ = tx.send(Event::GraceExpired { generation });
                }
            }
        });
    }

    fn force_kill(&mut self) {
        let Some(slot) = self.child.as_ref() else {
            return;
        };
        warn!(
            app = %self.spec.name,
            pid = ?self.state.pid,
            kill_timeout = ?self.spec.kill_timeout,
            "child did not stop in time, sending SIGKILL"
        );
        let _ = slot.signals.send(Signal::SIGKILL);
        self.note("grace period expired, sending SIGKILL");
    }

    fn check_memory(&mut self, rss: u64) {
        let Some(limit) = self.spec.max_memory_restart else {
            return;
        };
        if rss > limit && self.state.phase == Phase::Running {
            warn!(app = %self.spec.name, rss, limit, "memory limit exceeded");
            self.begin_stop(StopCause::MemoryLimitExceeded { rss, limit });
        }
    }

    fn finish(&mut self, reason: ExitReason) {
        if let Some(token) = self.pending_restart.take() {
            token.cancel();
        }
        info!(
            app = %self.spec.name,
            %reason,
            restarts = self.state.restart_counter,
            "supervisor finished"
        );
        self.transition(Phase::Exited(reason));
    }

    /// Cancels what is left, flushes the logs and publishes the terminal status.
    async fn teardown(mut self) {
        if let Some(token) = self.pending_restart.take() {
            token.cancel();
        }
        if let Some(slot) = self.child.take() {
            slot.token.cancel();
        }
        let logs = std::mem::replace(&mut self.logs, LogWriterHandle::detached());
        logs.close().await;
        self.publish();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.child
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Terminal phases are published by [`Self::teardown`], once the logs are flushed.
    fn transition(&mut self, phase: Phase) {
        let previous = std::mem::replace(&mut self.state.phase, phase);
        info!(app = %self.spec.name, from = %previous, to = %phase, "phase changed");
        self.note(match self.state.pid {
            Some(pid) if phase == Phase::Running => format!("{phase} (pid {pid})"),
            _ => phase.to_string(),
        });
        if !phase.is_terminal() {
            self.publish();
        }
    }

    /// Writes a lifecycle line to the combined log.
    fn note(&self, message: impl Into<String>) {
        self.logs.send(LogRecord::Lifecycle(message.into()));
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> SupervisorStatus {
        SupervisorStatus::new(&self.spec.name, &self.state)
    }
}

/// Owns the child until it exits: delivers signals, samples memory, then
/// drains the output pumps and reports the exit.
async fn watch_child(
    generation: u64,
    mut child: Box<dyn ChildProcess>,
    pumps: Vec<JoinHandle<()>>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    memory_check: Option<Duration>,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut memory_ticks = memory_check.map(|period| interval_at(Instant::now() + period, period));
    let exit = loop {
        tokio::select! {
            _ = token.cancelled() => {
                if let Err(err) = child.signal(Signal::SIGKILL) {
                    warn!(generation, "failed to kill child: {err}");
                }
                abort_all(&pumps);
                return;
            }
            status = child.wait() => {
                break status.unwrap_or_else(|err| {
                    warn!(generation, "failed to collect exit status: {err}");
                    ExitInfo::unknown()
                });
            }
            Some(signal) = signals.recv() => {
                if let Err(err) = child.signal(signal) {
                    warn!(generation, signal = signal.as_str(), "failed to signal child: {err}");
                }
            }
            _ = next_tick(&mut memory_ticks) => {
                if let Some(rss) = child.memory_usage() {
                    let _ = tx.send(Event::MemorySample { generation, rss });
                }
            }
        }
    };

    drain_pumps(pumps).await;
    let _ = tx.send(Event::Exited { generation, exit });
}

/// Descendants may still hold the pipes open, so draining is bounded.
async fn drain_pumps(pumps: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
    let joined = timeout(PUMP_DRAIN_TIMEOUT, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    if joined.is_err() {
        debug!("output still open after exit, dropping the rest");
        aborts.iter().for_each(|abort| abort.abort());
    }
}

fn abort_all(pumps: &[JoinHandle<()>]) {
    pumps.iter().for_each(JoinHandle::abort);
}

async fn next_tick(ticks: &mut Option<Interval>) {
    match ticks {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => future::pending().await,
    }
}
