//! Health monitoring: periodic probes deciding whether a service is ready
//!
//! A [`HealthMonitor`] sleeps its initial delay once, then fires its probe on
//! every interval tick. Each probe runs in its own task so a slow probe never
//! delays the next tick. Results carry the tick number they belong to and a
//! result older than one already published is discarded, so the published
//! status never moves backwards in tick order.

use crate::runtime::events::{StatusBus, StatusStream};
use crate::runtime::process::{ProcessController, ProcessSpec, RunOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default time between probes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest interval probes are fired at; a zero interval is raised to this
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on a single HTTP probe request
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthStatus {
    /// No probe result yet
    Pending,
    Passing,
    Failing,
    /// Monitor was torn down
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Pending => "Pending",
            HealthStatus::Passing => "Passing",
            HealthStatus::Failing => "Failing",
            HealthStatus::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL scheme for HTTP probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpScheme {
    #[default]
    Http,
    Https,
}

impl HttpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
        }
    }
}

/// What a health check runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSpec {
    /// Run a command; exit code 0 passes
    Command(ProcessSpec),
    /// GET `scheme://localhost:port/path`; status below 300 passes
    HttpGet {
        scheme: HttpScheme,
        port: u16,
        path: String,
    },
}

impl ProbeSpec {
    /// HTTP probe, normalising `path` to start with `/`
    pub fn http_get(scheme: HttpScheme, port: u16, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }
        ProbeSpec::HttpGet { scheme, port, path }
    }

    /// Target URL of an HTTP probe
    pub fn url(&self) -> Option<String> {
        match self {
            ProbeSpec::HttpGet { scheme, port, path } => Some(format!(
                "{}://localhost:{}{}",
                scheme.as_str(),
                port,
                path
            )),
            ProbeSpec::Command(_) => None,
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub probe: ProbeSpec,
    /// Time between probes
    pub interval: Duration,
    /// One-time pause before the first probe
    pub delay: Duration,
}

impl HealthCheckSpec {
    pub fn new(probe: ProbeSpec) -> Self {
        Self {
            probe,
            interval: DEFAULT_INTERVAL,
            delay: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Verdict of one probe invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Pass,
    Fail,
    /// Superseded before producing a verdict
    Abandoned,
}

/// A pluggable way of checking health
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run one check
    async fn perform(&self) -> ProbeOutcome;

    /// Release probe resources when the monitor stops
    async fn teardown(&self);
}

/// Runs a command on every tick, restarting it if the previous run is still going
pub struct CommandProbe {
    process: ProcessController,
}

impl CommandProbe {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            process: ProcessController::new(name, spec),
        }
    }

    pub fn process(&self) -> &ProcessController {
        &self.process
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn perform(&self) -> ProbeOutcome {
        match self.process.run_to_exit().await {
            RunOutcome::Exited(Some(0)) => ProbeOutcome::Pass,
            RunOutcome::Exited(code) => {
                log::debug!("[{}] Probe exited with {:?}", self.process.name(), code);
                ProbeOutcome::Fail
            }
            RunOutcome::SpawnFailed => ProbeOutcome::Fail,
            RunOutcome::Cancelled => ProbeOutcome::Abandoned,
        }
    }

    async fn teardown(&self) {
        self.process.stop().await;
    }
}

/// Issues a GET request on every tick
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        // Local dev services commonly serve self-signed certificates.
        let client = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn perform(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(res) if res.status().as_u16() < 300 => {
                log::debug!("GET {} -> {}", self.url, res.status());
                ProbeOutcome::Pass
            }
            Ok(res) => {
                log::warn!("GET {} -> {}", self.url, res.status());
                ProbeOutcome::Fail
            }
            Err(e) => {
                log::debug!("GET {} failed: {}", self.url, e);
                ProbeOutcome::Fail
            }
        }
    }

    async fn teardown(&self) {}
}

struct Ticker {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Polls a probe on a schedule and publishes the derived health status
pub struct HealthMonitor {
    name: String,
    spec: HealthCheckSpec,
    probe: Arc<dyn HealthProbe>,
    bus: StatusBus<HealthStatus>,
    ticker: tokio::sync::Mutex<Option<Ticker>>,
}

impl HealthMonitor {
    /// Create a monitor with the probe described by `spec`
    pub fn new(name: impl Into<String>, spec: HealthCheckSpec) -> Self {
        let name = name.into();
        let probe: Arc<dyn HealthProbe> = match &spec.probe {
            ProbeSpec::Command(process) => Arc::new(CommandProbe::new(
                format!("{}:healthcheck", name),
                process.clone(),
            )),
            http @ ProbeSpec::HttpGet { .. } => {
                Arc::new(HttpProbe::new(http.url().unwrap_or_default()))
            }
        };
        Self::with_probe(name, spec, probe)
    }

    /// Create a monitor around a custom probe
    pub fn with_probe(
        name: impl Into<String>,
        spec: HealthCheckSpec,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            probe,
            bus: StatusBus::new(HealthStatus::Pending),
            ticker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &HealthCheckSpec {
        &self.spec
    }

    pub fn status(&self) -> HealthStatus {
        self.bus.current()
    }

    pub fn events(&self) -> &StatusBus<HealthStatus> {
        &self.bus
    }

    pub fn subscribe(&self) -> StatusStream<HealthStatus> {
        self.bus.subscribe()
    }

    /// Begin ticking. Returns immediately; a no-op while already ticking.
    pub async fn start(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.as_ref().is_some_and(|t| !t.task.is_finished()) {
            log::debug!("[{}] Health monitor already running", self.name);
            return;
        }

        if self.bus.current() != HealthStatus::Pending {
            self.bus.publish(HealthStatus::Pending);
        }

        log::debug!(
            "[{}] Health monitor starting (delay {:?}, interval {:?})",
            self.name,
            self.spec.delay,
            self.spec.interval
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_ticks(
            self.name.clone(),
            self.probe.clone(),
            self.bus.clone(),
            self.spec.delay,
            self.spec.interval,
            shutdown_rx,
        ));
        *ticker = Some(Ticker { shutdown_tx, task });
    }

    /// Halt ticking, tear down the probe, and publish `Stopped`
    pub async fn stop(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(ticker) = ticker {
            let _ = ticker.shutdown_tx.send(true);
            if let Err(e) = ticker.task.await {
                log::error!("[{}] Health monitor task failed: {}", self.name, e);
            }
        }
        self.probe.teardown().await;
        log::debug!("[{}] Health monitor stopped", self.name);
        self.bus.publish(HealthStatus::Stopped);
    }
}

async fn run_ticks(
    name: String,
    probe: Arc<dyn HealthProbe>,
    bus: StatusBus<HealthStatus>,
    delay: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !delay.is_zero() {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut ticks = tokio::time::interval(interval.max(MIN_INTERVAL));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(u64, ProbeOutcome)>();
    let mut next_tick = 0u64;
    let mut last_applied: Option<u64> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            Some((tick, outcome)) = result_rx.recv() => {
                if last_applied.is_some_and(|last| tick < last) {
                    log::debug!("[{}] Discarding stale probe result from tick {}", name, tick);
                    continue;
                }
                let status = match outcome {
                    ProbeOutcome::Pass => HealthStatus::Passing,
                    ProbeOutcome::Fail => HealthStatus::Failing,
                    ProbeOutcome::Abandoned => continue,
                };
                last_applied = Some(tick);
                let previous = bus.current();
                if previous != status {
                    match status {
                        HealthStatus::Failing => log::warn!("[{}] Health check failing", name),
                        _ => log::info!("[{}] Health {} -> {}", name, previous, status),
                    }
                    bus.publish(status);
                }
            }
            _ = ticks.tick() => {
                next_tick += 1;
                let tick = next_tick;
                let probe = probe.clone();
                let result_tx = result_tx.clone();
                tokio::spawn(async move {
                    let outcome = probe.perform().await;
                    let _ = result_tx.send((tick, outcome));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe returning a scripted sequence of outcomes, then repeating the last
    struct ScriptedProbe {
        outcomes: Vec<ProbeOutcome>,
        calls: AtomicUsize,
        torn_down: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<ProbeOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes,
                calls: AtomicUsize::new(0),
                torn_down: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn perform(&self) -> ProbeOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let last = self.outcomes.len() - 1;
            self.outcomes[call.min(last)]
        }

        async fn teardown(&self) {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_spec() -> HealthCheckSpec {
        HealthCheckSpec::new(ProbeSpec::http_get(HttpScheme::Http, 1, "/"))
            .with_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_http_probe_url_normalises_path() {
        let probe = ProbeSpec::http_get(HttpScheme::Https, 8443, "health");
        assert_eq!(probe.url().as_deref(), Some("https://localhost:8443/health"));

        let probe = ProbeSpec::http_get(HttpScheme::Http, 80, "");
        assert_eq!(probe.url().as_deref(), Some("http://localhost:80"));
    }

    #[tokio::test]
    async fn test_zero_interval_still_reports() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Pass]);
        let spec = fast_spec().with_interval(Duration::ZERO);
        let monitor = HealthMonitor::with_probe("svc", spec, probe);
        let mut events = monitor.subscribe();

        monitor.start().await;
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(first.unwrap(), Some(HealthStatus::Passing));

        monitor.stop().await;
        assert_eq!(monitor.status(), HealthStatus::Stopped);
    }

    #[tokio::test]
    async fn test_transitions_follow_probe() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Fail, ProbeOutcome::Pass]);
        let monitor = HealthMonitor::with_probe("svc", fast_spec(), probe.clone());
        let mut events = monitor.subscribe();

        monitor.start().await;
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(first.unwrap(), Some(HealthStatus::Failing));
        let second = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(second.unwrap(), Some(HealthStatus::Passing));

        monitor.stop().await;
        assert_eq!(monitor.status(), HealthStatus::Stopped);
        assert_eq!(probe.torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_results_are_ignored() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Abandoned]);
        let monitor = HealthMonitor::with_probe("svc", fast_spec(), probe.clone());
        monitor.start().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(probe.calls.load(Ordering::SeqCst) > 1);
        assert_eq!(monitor.status(), HealthStatus::Pending);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_delay_postpones_first_probe() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Pass]);
        let spec = fast_spec().with_delay(Duration::from_millis(200));
        let monitor = HealthMonitor::with_probe("svc", spec, probe.clone());
        monitor.start().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.status(), HealthStatus::Pending);

        let passing = tokio::time::timeout(
            Duration::from_secs(2),
            monitor.events().wait_for(|s| *s == HealthStatus::Passing),
        )
        .await;
        assert!(passing.is_ok());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop_resets_to_pending() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Pass]);
        let spec = fast_spec().with_delay(Duration::from_secs(60));
        let monitor = HealthMonitor::with_probe("svc", spec, probe);

        monitor.start().await;
        monitor.stop().await;
        assert_eq!(monitor.status(), HealthStatus::Stopped);

        monitor.start().await;
        assert_eq!(monitor.status(), HealthStatus::Pending);
        monitor.stop().await;
    }
}
