//! Service launcher: starts each service once its dependencies are ready

use crate::runtime::composable::{Composable, ComposableStatus, Composition};
use crate::runtime::health::HealthCheckSpec;
use crate::runtime::process::ProcessSpec;
use crate::runtime::resolver::{spawn_resolver, DependencyResolver};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A named service: process, optional health check, dependencies
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,
    pub process: ProcessSpec,
    pub healthcheck: Option<HealthCheckSpec>,
    /// Names of services that must be ready first
    pub depends_on: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, process: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            process,
            healthcheck: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthCheckSpec) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// Milestone recorded while launching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    /// Start was called for the service
    Launched(String),
    /// The service failed to spawn
    LaunchFailed(String),
    /// The service reached readiness for the first time
    Ready(String),
}

struct LaunchTasks {
    resolver: JoinHandle<DependencyResolver>,
    dispatcher: JoinHandle<()>,
}

/// Launches services in dependency order
pub struct ServiceLauncher {
    composition: Arc<Composition>,
    dependencies: IndexMap<String, Vec<String>>,
    events: Arc<Mutex<Vec<LaunchEvent>>>,
    tasks: Mutex<Option<LaunchTasks>>,
    settled_tx: Mutex<Option<watch::Sender<Option<bool>>>>,
    settled_rx: watch::Receiver<Option<bool>>,
}

impl ServiceLauncher {
    /// Build composables for every service.
    ///
    /// Names must be unique, every dependency must name a declared service and
    /// health check intervals must be non-zero.
    /// Cycles are not rejected here: services on a cycle simply never launch.
    pub fn new(specs: Vec<ServiceSpec>) -> Result<Self, LauncherError> {
        let declared: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let mut composition = Composition::default();
        let mut dependencies = IndexMap::new();

        for spec in &specs {
            if dependencies.contains_key(&spec.name) {
                return Err(LauncherError::DuplicateService(spec.name.clone()));
            }
            if let Some(dep) = spec
                .depends_on
                .iter()
                .find(|dep| !declared.contains(dep.as_str()))
            {
                return Err(LauncherError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
            if spec
                .healthcheck
                .as_ref()
                .is_some_and(|check| check.interval.is_zero())
            {
                return Err(LauncherError::ZeroHealthCheckInterval(spec.name.clone()));
            }

            composition.insert(
                spec.name.clone(),
                Composable::new(&spec.name, spec.process.clone(), spec.healthcheck.clone()),
            );
            dependencies.insert(spec.name.clone(), spec.depends_on.clone());
        }

        let (settled_tx, settled_rx) = watch::channel(None);
        Ok(Self {
            composition: Arc::new(composition),
            dependencies,
            events: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(None),
            settled_tx: Mutex::new(Some(settled_tx)),
            settled_rx,
        })
    }

    /// All services, launched or not
    pub fn composition(&self) -> &Arc<Composition> {
        &self.composition
    }

    /// Current status of every service
    pub fn statuses(&self) -> IndexMap<String, ComposableStatus> {
        self.composition.statuses()
    }

    /// Launch milestones so far, in the order they happened
    pub fn launch_events(&self) -> Vec<LaunchEvent> {
        lock(&self.events).clone()
    }

    /// Services launched so far, in launch order
    pub fn launch_order(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                LaunchEvent::Launched(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Begin launching. Returns immediately; services come up in the background.
    pub fn launch(&self) -> Result<(), LauncherError> {
        let mut tasks = lock(&self.tasks);
        let Some(settled_tx) = lock(&self.settled_tx).take() else {
            return Err(LauncherError::AlreadyLaunched);
        };

        log::info!("Launching {} services...", self.composition.len());
        let resolver = DependencyResolver::new(
            self.dependencies
                .iter()
                .map(|(name, deps)| (name.clone(), deps.clone())),
        );
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();

        let resolver = spawn_resolver(resolver, ready_rx, launch_tx);
        let dispatcher = tokio::spawn(dispatch(
            self.composition.clone(),
            self.events.clone(),
            launch_rx,
            ready_tx,
            settled_tx,
        ));

        *tasks = Some(LaunchTasks {
            resolver,
            dispatcher,
        });
        Ok(())
    }

    /// Wait until launching settles.
    ///
    /// Returns `true` once every service is ready and `false` once nothing is
    /// left to launch while some service never became ready, e.g. it failed to
    /// spawn. Does not resolve while a launched service is still waiting to
    /// become ready, nor before `launch`.
    pub async fn wait_all_ready(&self) -> bool {
        let mut settled = self.settled_rx.clone();
        let ready = match settled.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).unwrap_or(false),
            Err(_) => false,
        };
        ready
    }

    /// Abandon pending launches, then stop services in reverse launch order
    pub async fn stop_all(&self) {
        let tasks = lock(&self.tasks).take();
        if let Some(tasks) = tasks {
            tasks.dispatcher.abort();
            tasks.resolver.abort();
            // A dispatcher mid-launch may still record a launch until it has wound down
            if let Err(e) = tasks.dispatcher.await {
                if !e.is_cancelled() {
                    log::error!("Launch dispatcher failed: {}", e);
                }
            }
            if let Err(e) = tasks.resolver.await {
                if !e.is_cancelled() {
                    log::error!("Dependency resolver failed: {}", e);
                }
            }
        }

        log::info!("Shutting down all services...");
        let mut order = self.launch_order();
        for name in self.composition.names() {
            if !order.iter().any(|n| n == name) {
                order.insert(0, name.to_string());
            }
        }
        for name in order.iter().rev() {
            if let Some(composable) = self.composition.get(name) {
                composable.stop().await;
            }
        }
        log::info!("All services shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Start services as the resolver releases them and report their readiness back
async fn dispatch(
    composition: Arc<Composition>,
    events: Arc<Mutex<Vec<LaunchEvent>>>,
    mut launch_rx: mpsc::UnboundedReceiver<String>,
    ready_tx: mpsc::UnboundedSender<String>,
    settled_tx: watch::Sender<Option<bool>>,
) {
    let mut launching = FuturesUnordered::new();
    let mut launches_open = true;
    let mut ready_count = 0;

    while launches_open || !launching.is_empty() {
        tokio::select! {
            launch = launch_rx.recv(), if launches_open => {
                let Some(name) = launch else {
                    launches_open = false;
                    continue;
                };
                let Some(composable) = composition.get(&name).cloned() else {
                    log::error!("Resolver released unknown service '{}'", name);
                    continue;
                };
                launching.push(launch_one(name, composable, events.clone()));
            }
            Some((name, ready)) = launching.next(), if !launching.is_empty() => {
                if ready {
                    ready_count += 1;
                    lock(&events).push(LaunchEvent::Ready(name.clone()));
                    log::info!("[{}] Ready", name);
                    let _ = ready_tx.send(name);
                }
            }
        }
    }
    let all_ready = ready_count == composition.len();
    if all_ready {
        log::info!("All services launched");
    } else {
        log::warn!(
            "Launching settled with {} of {} services ready",
            ready_count,
            composition.len()
        );
    }
    settled_tx.send_replace(Some(all_ready));
}

async fn launch_one(
    name: String,
    composable: Composable,
    events: Arc<Mutex<Vec<LaunchEvent>>>,
) -> (String, bool) {
    let readiness = composable.readiness();
    lock(&events).push(LaunchEvent::Launched(name.clone()));

    if let Err(e) = composable.start().await {
        log::error!("[{}] Launch failed: {}", name, e);
        lock(&events).push(LaunchEvent::LaunchFailed(name.clone()));
        return (name, false);
    }

    let ready = readiness.wait().await;
    (name, ready)
}

/// Errors that can occur when building a launcher
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service '{0}' has a health check interval of zero")]
    ZeroHealthCheckInterval(String),

    #[error("Services have already been launched")]
    AlreadyLaunched,
}
