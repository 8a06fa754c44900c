//! Service file YAML schema definitions

use crate::runtime::health::{HealthCheckSpec, HttpScheme, ProbeSpec};
use crate::runtime::launcher::ServiceSpec;
use crate::runtime::process::{ProcessError, ProcessSpec};
use crate::runtime::resolver::DependencyResolver;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names searched in a project directory, in order
pub const SERVICE_FILE_NAMES: [&str; 2] = ["maestro.yaml", "maestro.yml"];

/// Root service file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFile {
    /// Service definitions (ordered map for deterministic launch order)
    pub services: IndexMap<String, ServiceConfig>,
}

/// One declared service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Command line, split on whitespace
    pub exec: String,

    /// Working directory, relative to the service file's directory
    #[serde(default)]
    pub dir: Option<String>,

    /// Environment variables overlaid on the orchestrator's
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,

    /// Services that must be ready first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Health check: exactly one of `cmd` or `http`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub http: Option<HttpCheckConfig>,

    /// Pause before the first probe
    #[serde(default)]
    pub delay_ms: u64,

    /// Time between probes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheckConfig {
    #[serde(default)]
    pub scheme: HttpScheme,
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

impl ServiceFile {
    /// Locate the service file in `dir`, trying each of [`SERVICE_FILE_NAMES`]
    pub fn find(dir: &Path) -> Result<PathBuf, ServiceFileError> {
        SERVICE_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| ServiceFileError::NotFound {
                dir: dir.display().to_string(),
            })
    }

    /// Find and load the service file of a project directory
    pub fn from_dir(dir: &Path) -> Result<Self, ServiceFileError> {
        Self::from_file(&Self::find(dir)?)
    }

    /// Load service file from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ServiceFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServiceFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse service file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ServiceFileError> {
        let service_file: ServiceFile = serde_yaml::from_str(content)?;
        service_file.validate()?;
        Ok(service_file)
    }

    /// Validate the service file configuration
    pub fn validate(&self) -> Result<(), ServiceFileError> {
        if self.services.is_empty() {
            return Err(ServiceFileError::Validation(
                "no services declared".to_string(),
            ));
        }

        for (name, service) in &self.services {
            if service.exec.trim().is_empty() {
                return Err(ServiceFileError::Validation(format!(
                    "Service '{}': 'exec' must not be empty",
                    name
                )));
            }

            if let Some(check) = &service.healthcheck {
                match (&check.cmd, &check.http) {
                    (Some(cmd), None) if cmd.trim().is_empty() => {
                        return Err(ServiceFileError::Validation(format!(
                            "Service '{}': healthcheck 'cmd' must not be empty",
                            name
                        )));
                    }
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => {
                        return Err(ServiceFileError::Validation(format!(
                            "Service '{}': healthcheck needs exactly one of 'cmd' or 'http'",
                            name
                        )));
                    }
                }
                if check.interval_ms == 0 {
                    return Err(ServiceFileError::Validation(format!(
                        "Service '{}': healthcheck 'interval_ms' must be greater than 0",
                        name
                    )));
                }
            }

            for dep in &service.depends_on {
                if dep == name {
                    return Err(ServiceFileError::Validation(format!(
                        "Service '{}': depends on itself",
                        name
                    )));
                }
                if !self.services.contains_key(dep) {
                    return Err(ServiceFileError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if self.services.values().all(|s| !s.depends_on.is_empty()) {
            return Err(ServiceFileError::NoRootService);
        }

        self.launch_order().map(|_| ())
    }

    /// The order services would launch in if each became ready immediately
    pub fn launch_order(&self) -> Result<Vec<String>, ServiceFileError> {
        DependencyResolver::new(
            self.services
                .iter()
                .map(|(name, s)| (name.clone(), s.depends_on.clone())),
        )
        .launch_order()
        .map_err(ServiceFileError::CyclicDependency)
    }

    /// Turn the declarations into launchable specs.
    ///
    /// Relative `dir` values are resolved against `base_dir`, normally the
    /// directory holding the service file. Health check commands run with the
    /// same working directory and environment as their service.
    pub fn into_specs(self, base_dir: &Path) -> Result<Vec<ServiceSpec>, ServiceFileError> {
        self.services
            .into_iter()
            .map(|(name, service)| service.into_spec(name, base_dir))
            .collect()
    }
}

impl ServiceConfig {
    fn into_spec(self, name: String, base_dir: &Path) -> Result<ServiceSpec, ServiceFileError> {
        let working_dir = match &self.dir {
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };
        let invalid =
            |e: ProcessError| ServiceFileError::Validation(format!("Service '{}': {}", name, e));

        let process = ProcessSpec::parse(&self.exec)
            .map_err(invalid)?
            .with_working_dir(&working_dir)
            .with_env(self.env.clone());

        let healthcheck = match self.healthcheck {
            Some(check) => {
                let probe = match (check.cmd, check.http) {
                    (Some(cmd), _) => ProbeSpec::Command(
                        ProcessSpec::parse(&cmd)
                            .map_err(invalid)?
                            .with_working_dir(&working_dir)
                            .with_env(self.env.clone()),
                    ),
                    (None, Some(http)) => ProbeSpec::http_get(http.scheme, http.port, http.path),
                    (None, None) => {
                        return Err(ServiceFileError::Validation(format!(
                            "Service '{}': healthcheck needs exactly one of 'cmd' or 'http'",
                            name
                        )))
                    }
                };
                Some(
                    HealthCheckSpec::new(probe)
                        .with_interval(Duration::from_millis(check.interval_ms))
                        .with_delay(Duration::from_millis(check.delay_ms)),
                )
            }
            None => None,
        };

        Ok(ServiceSpec {
            name,
            process,
            healthcheck,
            depends_on: self.depends_on,
        })
    }
}

/// Errors that can occur when loading a service file
#[derive(Debug, thiserror::Error)]
pub enum ServiceFileError {
    #[error("No {} found in '{dir}'", SERVICE_FILE_NAMES.join(" or "))]
    NotFound { dir: String },

    #[error("Failed to read service file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse service file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service '{service}': depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Dependency cycle, these services can never start: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Every service has dependencies, nothing can start first")]
    NoRootService,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
services:
  postgres:
    exec: "postgres -D ./data"
    dir: db
    env: { PGPORT: "5432" }
    healthcheck:
      cmd: "pg_isready -p 5432"
      delay_ms: 1000
      interval_ms: 2000
  api:
    exec: "cargo run -p api"
    healthcheck:
      http: { port: 8080, path: health }
    depends_on: [postgres]
  web:
    exec: "npm start"
    depends_on: [api]
"#;

    #[test]
    fn test_parse_service_file() {
        let file = ServiceFile::from_yaml(EXAMPLE).unwrap();
        let names: Vec<&str> = file.services.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["postgres", "api", "web"]);

        let api = &file.services["api"];
        let check = api.healthcheck.as_ref().unwrap();
        assert_eq!(check.interval_ms, 1000);
        assert_eq!(check.delay_ms, 0);
        assert_eq!(check.http.as_ref().unwrap().scheme, HttpScheme::Http);
    }

    #[test]
    fn test_into_specs() {
        let file = ServiceFile::from_yaml(EXAMPLE).unwrap();
        let specs = file.into_specs(Path::new("/project")).unwrap();

        let postgres = &specs[0];
        assert_eq!(postgres.process.binary, "postgres");
        assert_eq!(postgres.process.args, vec!["-D", "./data"]);
        assert_eq!(
            postgres.process.working_dir.as_deref(),
            Some(Path::new("/project/db"))
        );
        assert_eq!(postgres.process.env["PGPORT"], "5432");
        let check = postgres.healthcheck.as_ref().unwrap();
        assert_eq!(check.interval, Duration::from_millis(2000));
        assert_eq!(check.delay, Duration::from_millis(1000));
        match &check.probe {
            ProbeSpec::Command(cmd) => assert_eq!(cmd.command_line(), "pg_isready -p 5432"),
            other => panic!("expected command probe, got {:?}", other),
        }

        let api = &specs[1];
        assert_eq!(api.depends_on, vec!["postgres"]);
        assert_eq!(
            api.healthcheck.as_ref().unwrap().probe.url().as_deref(),
            Some("http://localhost:8080/health")
        );
        assert!(specs[2].healthcheck.is_none());
    }

    #[test]
    fn test_launch_order() {
        let file = ServiceFile::from_yaml(EXAMPLE).unwrap();
        assert_eq!(file.launch_order().unwrap(), vec!["postgres", "api", "web"]);
    }

    #[test]
    fn test_validation_empty_exec() {
        let yaml = r#"
services:
  bad:
    exec: "   "
"#;
        assert!(matches!(
            ServiceFile::from_yaml(yaml),
            Err(ServiceFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_healthcheck_needs_one_probe() {
        let both = r#"
services:
  a:
    exec: "a"
    healthcheck:
      cmd: "check"
      http: { port: 80 }
"#;
        let neither = r#"
services:
  a:
    exec: "a"
    healthcheck:
      interval_ms: 100
"#;
        assert!(ServiceFile::from_yaml(both).is_err());
        assert!(ServiceFile::from_yaml(neither).is_err());
    }

    #[test]
    fn test_validation_zero_interval() {
        let yaml = r#"
services:
  a:
    exec: "a"
    healthcheck:
      cmd: "check"
      interval_ms: 0
"#;
        assert!(matches!(
            ServiceFile::from_yaml(yaml),
            Err(ServiceFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_unknown_dependency() {
        let yaml = r#"
services:
  a:
    exec: "a"
    depends_on: [ghost]
"#;
        assert!(matches!(
            ServiceFile::from_yaml(yaml),
            Err(ServiceFileError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_validation_self_dependency() {
        let yaml = r#"
services:
  root:
    exec: "root"
  a:
    exec: "a"
    depends_on: [a]
"#;
        assert!(matches!(
            ServiceFile::from_yaml(yaml),
            Err(ServiceFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_no_root() {
        let yaml = r#"
services:
  a:
    exec: "a"
    depends_on: [b]
  b:
    exec: "b"
    depends_on: [a]
"#;
        assert!(matches!(
            ServiceFile::from_yaml(yaml),
            Err(ServiceFileError::NoRootService)
        ));
    }

    #[test]
    fn test_validation_cycle() {
        let yaml = r#"
services:
  root:
    exec: "root"
  a:
    exec: "a"
    depends_on: [root, b]
  b:
    exec: "b"
    depends_on: [a]
"#;
        match ServiceFile::from_yaml(yaml) {
            Err(ServiceFileError::CyclicDependency(services)) => {
                assert_eq!(services, vec!["a", "b"])
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_find_prefers_yaml_over_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("maestro.yml"), "services: {}").unwrap();
        assert_eq!(
            ServiceFile::find(dir.path()).unwrap(),
            dir.path().join("maestro.yml")
        );

        std::fs::write(dir.path().join("maestro.yaml"), "services: {}").unwrap();
        assert_eq!(
            ServiceFile::find(dir.path()).unwrap(),
            dir.path().join("maestro.yaml")
        );
    }

    #[test]
    fn test_find_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ServiceFile::find(dir.path()),
            Err(ServiceFileError::NotFound { .. })
        ));
    }
}
