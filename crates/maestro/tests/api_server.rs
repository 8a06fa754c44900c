//! End-to-end: service file on disk, launch, status over HTTP

#![cfg(unix)]

mod common;

use common::{init_logging, within};
use maestro::{api, ServiceFile, ServiceLauncher};
use serde_json::Value;
use tokio::sync::watch;

const SERVICE_FILE: &str = r#"
services:
  db:
    exec: "sleep 30"
    healthcheck:
      cmd: "true"
      interval_ms: 50
  api:
    exec: "sleep 30"
    dir: app
    env: { PORT: "8080" }
    depends_on: [db]
"#;

#[tokio::test]
async fn test_status_api_end_to_end() {
    init_logging();
    let project = tempfile::tempdir().unwrap();
    std::fs::create_dir(project.path().join("app")).unwrap();
    std::fs::write(project.path().join("maestro.yaml"), SERVICE_FILE).unwrap();

    let service_file = ServiceFile::from_dir(project.path()).unwrap();
    assert_eq!(service_file.launch_order().unwrap(), vec!["db", "api"]);
    let launcher = ServiceLauncher::new(service_file.into_specs(project.path()).unwrap()).unwrap();

    let listener = api::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(api::run_http_server(
        listener,
        launcher.composition().clone(),
        shutdown_rx,
    ));

    let client = reqwest::Client::new();
    let before: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["db"], "NotStarted");
    assert_eq!(before["api"], "NotStarted");

    launcher.launch().unwrap();
    assert!(within("launch", launcher.wait_all_ready()).await);

    let after: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["db"], "Running");
    assert_eq!(after["api"], "Running");

    let db: Value = client
        .get(format!("{}/composable/db", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(db["name"], "db");
    assert_eq!(db["process"], "Running");
    assert_eq!(db["health"], "Passing");
    assert!(db["pid"].is_u64());

    let api_details: Value = client
        .get(format!("{}/composable/api", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(api_details["health"], Value::Null);
    assert_eq!(api_details["command"], "sleep 30");

    let missing = client
        .get(format!("{}/composable/ghost", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let api = launcher.composition().get("api").unwrap();
    let env = api.process().environment().await;
    assert_eq!(env["PORT"], "8080");
    assert_eq!(
        api.process().spec().working_dir.as_deref(),
        Some(project.path().join("app").as_path())
    );

    within("stop", launcher.stop_all()).await;
    shutdown_tx.send(true).unwrap();
    within("server", server).await.unwrap().unwrap();
}
