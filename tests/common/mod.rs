use std::{
    collections::VecDeque,
    future, io,
    sync::{Arc, Mutex},
    time::Duration,
};

use app_supervisor::{
    AppSpec, ChildProcess, ExitInfo, LaunchError, Launcher, OutputStream, Signal,
};
use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};

/// A spec for `name` that writes no log files.
#[allow(unused)]
pub fn quiet_spec(name: &str) -> AppSpec {
    let document = format!(
        r#"{{"name": "{name}", "script": "fake",
            "out_file": "/dev/null", "error_file": "/dev/null"}}"#
    );
    AppSpec::from_json(&document, None).unwrap()
}

/// What the next launched child does.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Exits with `code` after `after`.
    Exit { after: Duration, code: i32 },
    /// Runs until a signal it does not ignore arrives.
    Run { ignore: Vec<Signal>, rss: Option<u64> },
    /// Runs until signalled, then exits normally with `code` unless the
    /// signal was SIGKILL.
    Graceful { code: i32, rss: Option<u64> },
    /// Runs until signalled, having written `output` to stdout.
    Chatty { output: Vec<u8> },
    /// The launch itself fails.
    FailLaunch,
}

impl Plan {
    #[allow(unused)]
    pub fn crash_after(millis: u64) -> Self {
        Self::Exit {
            after: Duration::from_millis(millis),
            code: 1,
        }
    }

    #[allow(unused)]
    pub fn run_forever() -> Self {
        Self::Run {
            ignore: Vec::new(),
            rss: None,
        }
    }
}

#[derive(Default)]
struct Script {
    plans: VecDeque<Plan>,
    fallback: Option<Plan>,
    launches: Vec<Instant>,
    signals: Vec<Arc<Mutex<Vec<Signal>>>>,
}

/// Launches [`FakeChild`]ren following a queue of plans, then the fallback.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLauncher {
    pub fn new(plans: impl IntoIterator<Item = Plan>, fallback: Plan) -> Self {
        let script = Script {
            plans: plans.into_iter().collect(),
            fallback: Some(fallback),
            ..Script::default()
        };
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    #[allow(unused)]
    pub fn always(plan: Plan) -> Self {
        Self::new([], plan)
    }

    /// Instants of every launch attempt, failed ones included.
    #[allow(unused)]
    pub fn launches(&self) -> Vec<Instant> {
        self.script.lock().unwrap().launches.clone()
    }

    #[allow(unused)]
    pub fn launch_count(&self) -> usize {
        self.script.lock().unwrap().launches.len()
    }

    /// Signals delivered to the `index`-th successfully launched child.
    #[allow(unused)]
    pub fn signals(&self, index: usize) -> Vec<Signal> {
        self.script.lock().unwrap().signals[index]
            .lock()
            .unwrap()
            .clone()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, _spec: &AppSpec) -> Result<Box<dyn ChildProcess>, LaunchError> {
        let mut script = self.script.lock().unwrap();
        let now = Instant::now();
        script.launches.push(now);
        let plan = match script.plans.pop_front() {
            Some(plan) => plan,
            None => script.fallback.clone().unwrap_or_else(Plan::run_forever),
        };
        let pid = 1000 + script.launches.len() as u32;
        let received = Arc::new(Mutex::new(Vec::new()));

        let child = match plan {
            Plan::FailLaunch => {
                return Err(LaunchError::ExecutableNotFound {
                    program: "fake".to_string(),
                })
            }
            Plan::Exit { after, code } => FakeChild {
                exit_at: Some((now + after, code)),
                ..FakeChild::new(pid, &received)
            },
            Plan::Run { ignore, rss } => FakeChild {
                ignore,
                rss,
                ..FakeChild::new(pid, &received)
            },
            Plan::Graceful { code, rss } => FakeChild {
                rss,
                graceful_code: Some(code),
                ..FakeChild::new(pid, &received)
            },
            Plan::Chatty { output } => FakeChild {
                stdout: Some(output),
                ..FakeChild::new(pid, &received)
            },
        };
        script.signals.push(received);
        Ok(Box::new(child))
    }
}

/// An in-memory child driven by tokio time.
pub struct FakeChild {
    pid: u32,
    exit_at: Option<(Instant, i32)>,
    ignore: Vec<Signal>,
    rss: Option<u64>,
    killed_by: Option<Signal>,
    graceful_code: Option<i32>,
    stdout: Option<Vec<u8>>,
    received: Arc<Mutex<Vec<Signal>>>,
}

impl FakeChild {
    fn new(pid: u32, received: &Arc<Mutex<Vec<Signal>>>) -> Self {
        Self {
            pid,
            exit_at: None,
            ignore: Vec::new(),
            rss: None,
            killed_by: None,
            graceful_code: None,
            stdout: None,
            received: Arc::clone(received),
        }
    }
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .take()
            .map(|output| Box::new(io::Cursor::new(output)) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        None
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        if let Some(signal) = self.killed_by {
            return Ok(match self.graceful_code {
                Some(code) if signal != Signal::SIGKILL => ExitInfo::exited(code),
                _ => ExitInfo::killed(signal),
            });
        }
        match self.exit_at {
            Some((deadline, code)) => {
                sleep_until(deadline).await;
                Ok(ExitInfo::exited(code))
            }
            None => future::pending().await,
        }
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        self.received.lock().unwrap().push(signal);
        if signal == Signal::SIGKILL || !self.ignore.contains(&signal) {
            self.killed_by.get_or_insert(signal);
        }
        Ok(())
    }

    fn memory_usage(&self) -> Option<u64> {
        self.rss
    }
}
