//! HTTP status API
//!
//! Read-only view of a running composition for dashboards and scripts.

use crate::runtime::composable::{Composable, ComposableStatus, Composition};
use crate::runtime::health::HealthStatus;
use crate::runtime::process::ProcessStatus;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Default listening port
pub const DEFAULT_PORT: u16 = 4357;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub composition: Arc<Composition>,
}

/// JSON response for a single composable
#[derive(Debug, Serialize)]
pub struct ComposableResponse {
    pub name: String,
    pub status: ComposableStatus,
    pub process: ProcessStatus,
    pub health: Option<HealthStatus>,
    pub pid: Option<u32>,
    pub command: String,
    pub output: Vec<String>,
}

/// JSON response for a slice of captured output
#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub name: String,
    pub from: usize,
    pub total: usize,
    pub lines: Vec<String>,
}

/// Query params for the composable view
#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

/// Query params for output paging
#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

/// GET /health - Liveness of the API itself
async fn health_check() -> &'static str {
    "ok"
}

/// GET /status - Status of every composable
async fn get_status(State(state): State<AppState>) -> Json<IndexMap<String, ComposableStatus>> {
    Json(state.composition.statuses())
}

/// GET /composable/{name} - Details of one composable
async fn get_composable(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<ComposableResponse>, StatusCode> {
    let composable = state
        .composition
        .get(&name)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(describe(&name, composable, query.lines).await))
}

/// GET /composable/{name}/output - Page through captured output
async fn get_output(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<OutputResponse>, StatusCode> {
    let composable = state
        .composition
        .get(&name)
        .ok_or(StatusCode::NOT_FOUND)?;
    let output = composable.process().output();
    Ok(Json(OutputResponse {
        name,
        from: query.from,
        total: output.len(),
        lines: output.lines(query.from, query.lines),
    }))
}

async fn describe(name: &str, composable: &Composable, tail: usize) -> ComposableResponse {
    let process = composable.process();
    ComposableResponse {
        name: name.to_string(),
        status: composable.status(),
        process: process.status(),
        health: composable.monitor().map(|m| m.status()),
        pid: process.pid().await,
        command: process.spec().command_line(),
        output: process.output().tail(tail),
    }
}

/// Create the HTTP router
pub fn create_router(composition: Arc<Composition>) -> Router {
    let state = AppState { composition };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/composable/{name}", get(get_composable))
        .route("/composable/{name}/output", get(get_output))
        .with_state(state)
}

/// Bind the API listener
pub async fn bind(addr: &str) -> Result<TcpListener, ApiError> {
    TcpListener::bind(addr).await.map_err(|e| ApiError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Serve the API until `shutdown` turns `true`
pub async fn run_http_server(
    listener: TcpListener,
    composition: Arc<Composition>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    let app = create_router(composition);
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP API listening on http://{}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(ApiError::Serve)?;

    log::info!("HTTP API stopped");
    Ok(())
}

/// Address the API binds to by default for `port`
pub fn local_addr(port: u16) -> String {
    SocketAddr::from(([127, 0, 0, 1], port)).to_string()
}

/// Errors that can occur when serving the API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Failed to bind HTTP API on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP API failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process::ProcessSpec;

    fn state() -> AppState {
        let mut composition = Composition::default();
        composition.insert(
            "api",
            Composable::new("api", ProcessSpec::new("sleep", vec!["1".into()]), None),
        );
        composition
            .get("api")
            .unwrap()
            .process()
            .output()
            .push("listening");
        AppState {
            composition: Arc::new(composition),
        }
    }

    #[tokio::test]
    async fn test_status_lists_every_composable() {
        let Json(statuses) = get_status(State(state())).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["api"], ComposableStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_composable_details() {
        let Json(details) = get_composable(
            State(state()),
            Path("api".to_string()),
            Query(TailQuery { lines: 10 }),
        )
        .await
        .unwrap();
        assert_eq!(details.status, ComposableStatus::NotStarted);
        assert_eq!(details.process, ProcessStatus::NotStarted);
        assert_eq!(details.health, None);
        assert_eq!(details.pid, None);
        assert_eq!(details.command, "sleep 1");
        assert_eq!(details.output, vec!["listening"]);
    }

    #[tokio::test]
    async fn test_unknown_composable_is_not_found() {
        let result = get_composable(
            State(state()),
            Path("ghost".to_string()),
            Query(TailQuery { lines: 10 }),
        )
        .await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_output_paging() {
        let state = state();
        let Json(page) = get_output(
            State(state),
            Path("api".to_string()),
            Query(OutputQuery { from: 1, lines: 10 }),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.lines.is_empty());
    }

    #[test]
    fn test_local_addr() {
        assert_eq!(local_addr(DEFAULT_PORT), "127.0.0.1:4357");
    }
}
