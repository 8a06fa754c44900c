//! Test helpers for process and launch integration tests

#![allow(dead_code)]

use axum::{http::StatusCode, routing::get, Router};
use maestro::ProcessSpec;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A `sh -c` command
pub fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()])
        .with_stop_grace(Duration::from_secs(1))
}

/// Await `fut`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match timeout(WAIT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Local HTTP server whose `/health` answers 200 or 503 depending on a switch
pub struct HealthServer {
    pub port: u16,
    healthy: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl HealthServer {
    pub async fn start(healthy: bool) -> Self {
        let flag = Arc::new(AtomicBool::new(healthy));
        let state = flag.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let state = state.clone();
                async move {
                    if state.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            port,
            healthy: flag,
            task,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
