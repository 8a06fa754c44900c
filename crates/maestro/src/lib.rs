//! Maestro
//!
//! A local development orchestrator: starts a project's services in
//! dependency order and keeps them supervised.
//!
//! # Overview
//!
//! Maestro allows you to:
//! - Define services, their health checks and dependencies in a YAML file
//! - Launch each service only once everything it depends on is ready
//! - Watch service status and output over a small HTTP API
//! - Gracefully shutdown services in reverse launch order
//!
//! A service without a health check is ready as soon as its process runs.
//! With one, it is ready on the first passing probe.
//!
//! # Example Service File
//!
//! ```yaml
//! services:
//!   postgres:
//!     exec: "postgres -D ./data"
//!     healthcheck:
//!       cmd: "pg_isready -p 5432"
//!       interval_ms: 2000
//!
//!   api:
//!     exec: "cargo run -p api"
//!     healthcheck:
//!       http: { port: 8080, path: /health }
//!     depends_on:
//!       - postgres
//!
//!   web:
//!     exec: "npm start"
//!     dir: web
//!     depends_on:
//!       - api
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::MaestroArgs;
pub use config::{ServiceFile, ServiceFileError};
pub use runtime::{
    Composable, ComposableStatus, Composition, DependencyResolver, HealthCheckSpec,
    HealthMonitor, HealthStatus, LaunchEvent, LauncherError, ProbeSpec, ProcessController,
    ProcessError, ProcessSpec, ProcessStatus, ServiceLauncher, ServiceSpec, StatusBus,
};
