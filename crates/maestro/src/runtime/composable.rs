//! Composables: one status contract over bare and health-checked processes

use crate::runtime::events::StatusStream;
use crate::runtime::health::{HealthCheckSpec, HealthMonitor, HealthStatus};
use crate::runtime::process::{ProcessController, ProcessError, ProcessSpec, ProcessStatus};
use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;

/// Status of a composable or a whole composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComposableStatus {
    NotStarted,
    Starting,
    /// Running, and healthy if a health check is declared
    Running,
    /// Running with a failing health check
    Failing,
    Error,
    Stopped,
}

impl ComposableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposableStatus::NotStarted => "NotStarted",
            ComposableStatus::Starting => "Starting",
            ComposableStatus::Running => "Running",
            ComposableStatus::Failing => "Failing",
            ComposableStatus::Error => "Error",
            ComposableStatus::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for ComposableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a composable's status from its process and optional health monitor.
///
/// Without a monitor the process status maps 1:1. With one, a running process
/// only counts as `Running` while the monitor reports `Passing`; until the
/// first verdict (or after the monitor is torn down) it is still `Starting`.
pub fn derive_status(process: ProcessStatus, health: Option<HealthStatus>) -> ComposableStatus {
    match process {
        ProcessStatus::NotStarted => ComposableStatus::NotStarted,
        ProcessStatus::Starting => ComposableStatus::Starting,
        ProcessStatus::Stopped => ComposableStatus::Stopped,
        ProcessStatus::Error => ComposableStatus::Error,
        ProcessStatus::Running => match health {
            None | Some(HealthStatus::Passing) => ComposableStatus::Running,
            Some(HealthStatus::Failing) => ComposableStatus::Failing,
            Some(HealthStatus::Pending) | Some(HealthStatus::Stopped) => {
                ComposableStatus::Starting
            }
        },
    }
}

/// Aggregate member statuses into one composition status.
///
/// `Error` if any member errored; otherwise `Failing` if any is failing;
/// `Running`, `Stopped` or `NotStarted` when every member agrees; `Starting`
/// for any other mix. An empty set is `NotStarted`.
pub fn aggregate_status<I>(statuses: I) -> ComposableStatus
where
    I: IntoIterator<Item = ComposableStatus>,
{
    let statuses: Vec<ComposableStatus> = statuses.into_iter().collect();
    let all = |wanted: ComposableStatus| statuses.iter().all(|s| *s == wanted);

    if statuses.is_empty() {
        ComposableStatus::NotStarted
    } else if statuses.contains(&ComposableStatus::Error) {
        ComposableStatus::Error
    } else if statuses.contains(&ComposableStatus::Failing) {
        ComposableStatus::Failing
    } else if all(ComposableStatus::Running) {
        ComposableStatus::Running
    } else if all(ComposableStatus::Stopped) {
        ComposableStatus::Stopped
    } else if all(ComposableStatus::NotStarted) {
        ComposableStatus::NotStarted
    } else {
        ComposableStatus::Starting
    }
}

/// A process, optionally guarded by a health check
#[derive(Clone)]
pub enum Composable {
    BareProcess(Arc<ProcessController>),
    HealthCheckedProcess {
        process: Arc<ProcessController>,
        monitor: Arc<HealthMonitor>,
    },
}

impl Composable {
    pub fn new(name: &str, spec: ProcessSpec, healthcheck: Option<HealthCheckSpec>) -> Self {
        let process = Arc::new(ProcessController::new(name, spec));
        match healthcheck {
            None => Composable::BareProcess(process),
            Some(check) => Composable::HealthCheckedProcess {
                process,
                monitor: Arc::new(HealthMonitor::new(name, check)),
            },
        }
    }

    pub fn process(&self) -> &Arc<ProcessController> {
        match self {
            Composable::BareProcess(process) => process,
            Composable::HealthCheckedProcess { process, .. } => process,
        }
    }

    pub fn monitor(&self) -> Option<&Arc<HealthMonitor>> {
        match self {
            Composable::BareProcess(_) => None,
            Composable::HealthCheckedProcess { monitor, .. } => Some(monitor),
        }
    }

    pub fn name(&self) -> &str {
        self.process().name()
    }

    /// Start the process, then its health monitor
    pub async fn start(&self) -> Result<(), ProcessError> {
        self.process().start().await?;
        if let Some(monitor) = self.monitor() {
            monitor.start().await;
        }
        Ok(())
    }

    /// Restart the process; a health monitor starts over from `Pending`
    pub async fn restart(&self) -> Result<(), ProcessError> {
        if let Some(monitor) = self.monitor() {
            monitor.stop().await;
        }
        self.process().restart().await?;
        if let Some(monitor) = self.monitor() {
            monitor.start().await;
        }
        Ok(())
    }

    /// Stop the health monitor, then the process
    pub async fn stop(&self) {
        if let Some(monitor) = self.monitor() {
            monitor.stop().await;
        }
        self.process().stop().await;
    }

    pub fn status(&self) -> ComposableStatus {
        derive_status(
            self.process().status(),
            self.monitor().map(|m| m.status()),
        )
    }

    /// Resolve once the composable is ready; see [`Readiness::wait`]
    pub async fn wait_ready(&self) -> bool {
        self.readiness().wait().await
    }

    /// Subscribe to the one-time readiness event.
    ///
    /// Subscribing replays recent history, so readiness reached before the
    /// call is still reported.
    pub fn readiness(&self) -> Readiness {
        match self {
            Composable::BareProcess(process) => {
                Readiness::Process(process.events().subscribe_with_history())
            }
            Composable::HealthCheckedProcess { monitor, .. } => {
                Readiness::Health(monitor.events().subscribe_with_history())
            }
        }
    }
}

/// Pending readiness event of one composable
pub enum Readiness {
    Process(StatusStream<ProcessStatus>),
    Health(StatusStream<HealthStatus>),
}

impl Readiness {
    /// Resolve with `true` the first time the composable is ready:
    /// `Running` without a health check, `Passing` with one.
    ///
    /// Resolves `false` if the composable is dropped first; may wait forever
    /// if readiness is never reached.
    pub async fn wait(self) -> bool {
        match self {
            Readiness::Process(mut stream) => {
                while let Some(status) = stream.recv().await {
                    if status == ProcessStatus::Running {
                        return true;
                    }
                }
                false
            }
            Readiness::Health(mut stream) => {
                while let Some(status) = stream.recv().await {
                    if status == HealthStatus::Passing {
                        return true;
                    }
                }
                false
            }
        }
    }
}

/// Named composables started and stopped together, with no ordering
#[derive(Clone, Default)]
pub struct Composition {
    members: IndexMap<String, Composable>,
}

impl Composition {
    pub fn new(members: IndexMap<String, Composable>) -> Self {
        Self { members }
    }

    pub fn insert(&mut self, name: impl Into<String>, composable: Composable) {
        self.members.insert(name.into(), composable);
    }

    pub fn get(&self, name: &str) -> Option<&Composable> {
        self.members.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Composable)> {
        self.members.iter().map(|(name, c)| (name.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Start every member concurrently.
    ///
    /// Spawn failures are logged and left on the member's status; the
    /// number of members that failed to start is returned.
    pub async fn start(&self) -> usize {
        log::info!("Starting {} composables...", self.members.len());
        let results = join_all(self.members.values().map(|c| c.start())).await;
        results
            .iter()
            .zip(self.members.keys())
            .filter_map(|(result, name)| result.as_ref().err().map(|e| (name, e)))
            .inspect(|(name, e)| log::error!("[{}] {}", name, e))
            .count()
    }

    /// Stop every member concurrently
    pub async fn stop(&self) {
        join_all(self.members.values().map(|c| c.stop())).await;
    }

    /// Aggregate status of all members
    pub fn status(&self) -> ComposableStatus {
        aggregate_status(self.members.values().map(Composable::status))
    }

    /// Per-member status, in declaration order
    pub fn statuses(&self) -> IndexMap<String, ComposableStatus> {
        self.members
            .iter()
            .map(|(name, c)| (name.clone(), c.status()))
            .collect()
    }
}
