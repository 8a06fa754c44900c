//! Process controller: spawns, cancels and reaps one OS child

use crate::runtime::events::{StatusBus, StatusStream};
use crate::runtime::output::{OutputLog, OutputStream};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Time the reaper waits for captured output to reach EOF once the child exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Time a child gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessStatus {
    /// Created, never started
    NotStarted,
    /// Spawn in progress
    Starting,
    /// Child is alive
    Running,
    /// Exited cleanly or was stopped by its controller
    Stopped,
    /// Failed to spawn or exited nonzero on its own
    Error,
}

impl ProcessStatus {
    /// Check if process is starting or running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running | ProcessStatus::Starting)
    }

    /// Check if process has reached an exit state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::NotStarted => "NotStarted",
            ProcessStatus::Starting => "Starting",
            ProcessStatus::Running => "Running",
            ProcessStatus::Stopped => "Stopped",
            ProcessStatus::Error => "Error",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable name or path
    pub binary: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory (inherits the orchestrator's when `None`)
    pub working_dir: Option<PathBuf>,
    /// Variables overlaid on the orchestrator's environment
    pub env: HashMap<String, String>,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
}

impl ProcessSpec {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Build a spec from a shell-style command string.
    ///
    /// `ls -a /` becomes binary `ls` with args `["-a", "/"]`. Splitting is on
    /// whitespace only; quoting is not interpreted.
    pub fn parse(command: &str) -> Result<Self, ProcessError> {
        let mut words = command.split_whitespace().map(String::from);
        let binary = words
            .next()
            .ok_or_else(|| ProcessError::InvalidCommand(command.to_string()))?;
        Ok(Self::new(binary, words.collect()))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The command line as it would be typed
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.binary.clone()
        } else {
            format!("{} {}", self.binary, self.args.join(" "))
        }
    }

    /// The orchestrator's environment overlaid with this spec's variables
    fn effective_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.env.clone());
        env
    }
}

/// How one run of a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub pid: u32,
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Whether the controller's cancellation handle ended the run
    pub cancelled: bool,
}

/// Result of [`ProcessController::run_to_exit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child exited on its own
    Exited(Option<i32>),
    /// The run was cancelled by a stop or a later restart
    Cancelled,
    /// The child could not be spawned
    SpawnFailed,
}

/// Book-keeping for the current child
struct RunHandle {
    pid: u32,
    env: HashMap<String, String>,
    cancelled: Arc<AtomicBool>,
    cancel_tx: Option<oneshot::Sender<()>>,
    exited_rx: watch::Receiver<Option<ExitRecord>>,
}

impl RunHandle {
    fn has_exited(&self) -> bool {
        self.exited_rx.borrow().is_some()
    }
}

/// Owns one OS child process's full lifecycle
pub struct ProcessController {
    name: String,
    spec: ProcessSpec,
    bus: StatusBus<ProcessStatus>,
    output: OutputLog,
    last_exit: Arc<Mutex<Option<ExitRecord>>>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl ProcessController {
    /// Create a controller; nothing is spawned until [`start`](Self::start)
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            bus: StatusBus::new(ProcessStatus::NotStarted),
            output: OutputLog::default(),
            last_exit: Arc::new(Mutex::new(None)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Latest status
    pub fn status(&self) -> ProcessStatus {
        self.bus.current()
    }

    /// The status bus, for waiting on or inspecting transitions
    pub fn events(&self) -> &StatusBus<ProcessStatus> {
        &self.bus
    }

    /// Subscribe to status transitions from now on
    pub fn subscribe(&self) -> StatusStream<ProcessStatus> {
        self.bus.subscribe()
    }

    /// Captured stdout/stderr lines
    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    /// How the most recent run ended
    pub fn last_exit(&self) -> Option<ExitRecord> {
        *self.last_exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// PID of the live child, if any
    pub async fn pid(&self) -> Option<u32> {
        let run = self.run.lock().await;
        run.as_ref().filter(|h| !h.has_exited()).map(|h| h.pid)
    }

    /// Effective environment of the live child; empty when not running
    pub async fn environment(&self) -> HashMap<String, String> {
        let run = self.run.lock().await;
        match run.as_ref() {
            Some(handle) if !handle.has_exited() => handle.env.clone(),
            _ => HashMap::new(),
        }
    }

    /// Spawn the child.
    ///
    /// Returns once the spawn has succeeded or failed; a background task reaps
    /// the child and publishes its exit status.
    pub async fn start(&self) -> Result<(), ProcessError> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run)
    }

    /// Cancel the child and wait until it has been reaped. No-op if not started.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await;
    }

    /// Stop the child if it is running, then start it again
    pub async fn restart(&self) -> Result<(), ProcessError> {
        log::debug!("[{}] Restarting", self.name);
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await;
        self.start_locked(&mut run)
    }

    /// Restart the child and wait for that run to end.
    ///
    /// A concurrent restart cancels the run in flight, which then reports
    /// [`RunOutcome::Cancelled`].
    pub async fn run_to_exit(&self) -> RunOutcome {
        let mut exited_rx = {
            let mut run = self.run.lock().await;
            self.stop_locked(&mut run).await;
            if self.start_locked(&mut run).is_err() {
                return RunOutcome::SpawnFailed;
            }
            match run.as_ref() {
                Some(handle) => handle.exited_rx.clone(),
                None => return RunOutcome::SpawnFailed,
            }
        };

        let record = match exited_rx.wait_for(|r| r.is_some()).await {
            Ok(record) => *record,
            Err(_) => None,
        };
        match record {
            Some(record) if record.cancelled => RunOutcome::Cancelled,
            Some(record) => RunOutcome::Exited(record.code),
            None => RunOutcome::Cancelled,
        }
    }

    fn start_locked(&self, run: &mut Option<RunHandle>) -> Result<(), ProcessError> {
        if run.as_ref().is_some_and(|h| !h.has_exited()) {
            return Err(ProcessError::AlreadyRunning(self.name.clone()));
        }
        *run = None;

        self.publish(ProcessStatus::Starting);
        log::info!("[{}] Starting: {}", self.name, self.spec.command_line());

        let env = self.spec.effective_env();
        let mut cmd = Command::new(&self.spec.binary);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("[{}] Failed to spawn process: {}", self.name, e);
                self.publish(ProcessStatus::Error);
                return Err(ProcessError::SpawnFailed {
                    name: self.name.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        self.publish(ProcessStatus::Running);
        log::info!("[{}] Process started with PID: {}", self.name, pid);

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(
                self.output
                    .capture(self.name.clone(), stdout, OutputStream::Stdout),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(
                self.output
                    .capture(self.name.clone(), stderr, OutputStream::Stderr),
            );
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(None);

        tokio::spawn(reap(Reaper {
            name: self.name.clone(),
            child,
            pid,
            grace: self.spec.stop_grace,
            cancelled: cancelled.clone(),
            cancel_rx,
            output,
            exited_tx,
            bus: self.bus.clone(),
            last_exit: self.last_exit.clone(),
        }));

        *run = Some(RunHandle {
            pid,
            env,
            cancelled,
            cancel_tx: Some(cancel_tx),
            exited_rx,
        });
        Ok(())
    }

    async fn stop_locked(&self, run: &mut Option<RunHandle>) {
        let Some(mut handle) = run.take() else {
            log::debug!("[{}] Stop requested but process was never started", self.name);
            return;
        };
        if handle.has_exited() {
            return;
        }

        log::info!("[{}] Stopping process {}...", self.name, handle.pid);
        handle.cancelled.store(true, Ordering::SeqCst);
        if let Some(cancel_tx) = handle.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }

        let reaped = match handle.exited_rx.wait_for(|r| r.is_some()).await {
            Ok(record) => (*record).map(|r| r.pid),
            Err(_) => None,
        };
        match reaped {
            Some(pid) if pid == handle.pid => {
                log::debug!("[{}] Process {} reaped", self.name, pid)
            }
            Some(pid) => log::error!(
                "[{}] Reaped PID {} while stopping PID {}",
                self.name,
                pid,
                handle.pid
            ),
            None => log::error!("[{}] Reaper exited without reporting", self.name),
        }
    }

    fn publish(&self, status: ProcessStatus) {
        log::debug!("[{}] {} -> {}", self.name, self.bus.current(), status);
        self.bus.publish(status);
    }
}

/// State moved into the background reaping task
struct Reaper {
    name: String,
    child: Child,
    pid: u32,
    grace: Duration,
    cancelled: Arc<AtomicBool>,
    cancel_rx: oneshot::Receiver<()>,
    /// Capture tasks for the child's stdout and stderr
    output: Vec<JoinHandle<()>>,
    exited_tx: watch::Sender<Option<ExitRecord>>,
    bus: StatusBus<ProcessStatus>,
    last_exit: Arc<Mutex<Option<ExitRecord>>>,
}

async fn reap(mut reaper: Reaper) {
    // A dropped cancel sender means the controller itself went away; the child goes with it.
    let (result, by_cancel) = tokio::select! {
        result = reaper.child.wait() => (result, false),
        _ = &mut reaper.cancel_rx => {
            (terminate(&mut reaper.child, reaper.pid, reaper.grace, &reaper.name).await, true)
        }
    };

    // Pipes inherited by a surviving grandchild stay open; don't wait on those
    let capture = futures::future::join_all(std::mem::take(&mut reaper.output));
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, capture).await.is_err() {
        log::debug!("[{}] Output still open after exit", reaper.name);
    }

    let cancelled = by_cancel || reaper.cancelled.load(Ordering::SeqCst);
    let code = result.as_ref().ok().and_then(ExitStatus::code);
    let success = result.as_ref().is_ok_and(ExitStatus::success);

    let status = if cancelled || success {
        ProcessStatus::Stopped
    } else {
        ProcessStatus::Error
    };

    match &result {
        Ok(exit) => log::info!("[{}] Process exited with {}", reaper.name, exit),
        Err(e) => log::error!("[{}] Error waiting for process: {}", reaper.name, e),
    }

    let record = ExitRecord {
        pid: reaper.pid,
        code,
        cancelled,
    };
    *reaper.last_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);

    log::debug!("[{}] {} -> {}", reaper.name, reaper.bus.current(), status);
    reaper.bus.publish(status);
    reaper.exited_tx.send_replace(Some(record));
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
    name: &str,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if raw > 0 && kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok() {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(result) => return result,
                    Err(_) => log::warn!(
                        "[{}] Process did not exit gracefully, forcing kill",
                        name
                    ),
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, grace, name);

    if let Err(e) = child.start_kill() {
        log::debug!("[{}] Kill failed: {}", name, e);
    }
    child.wait().await
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command: '{0}'")]
    InvalidCommand(String),
}
