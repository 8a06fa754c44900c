//! maestro CLI
//!
//! Usage:
//!   maestro                  # services of ./maestro.yaml
//!   maestro path/to/project --port 8080
//!   maestro --validate

use anyhow::Context;
use maestro::{api, MaestroArgs, ServiceFile, ServiceLauncher};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: MaestroArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    let project_dir = args.project_dir();
    let path = ServiceFile::find(&project_dir)?;
    log::info!("Loading service file: {}", path.display());
    let service_file = ServiceFile::from_file(&path)?;

    // Validate only mode
    if args.validate {
        let order = service_file.launch_order()?;
        println!("Service file '{}' is valid", path.display());
        println!("  Services: {}", service_file.services.len());
        println!("  Launch order: {}", order.join(" -> "));
        return Ok(());
    }

    let launcher = ServiceLauncher::new(service_file.into_specs(&project_dir)?)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(true);
        })
        .context("Error setting Ctrl+C handler")?;
    }

    let api_task = if args.no_api {
        None
    } else {
        let listener = api::bind(&api::local_addr(args.port)).await?;
        Some(tokio::spawn(api::run_http_server(
            listener,
            launcher.composition().clone(),
            shutdown_rx.clone(),
        )))
    };

    launcher.launch()?;

    let mut until_shutdown = shutdown_rx.clone();
    let mut after_ready = shutdown_rx.clone();
    tokio::select! {
        all_ready = launcher.wait_all_ready() => {
            if all_ready {
                log::info!("All services are ready, press Ctrl+C to stop");
            } else {
                log::warn!("Some services failed to launch, press Ctrl+C to stop");
            }
            let _ = after_ready.wait_for(|stop| *stop).await;
        }
        _ = until_shutdown.wait_for(|stop| *stop) => {}
    }

    launcher.stop_all().await;

    if let Some(task) = api_task {
        match task.await {
            Ok(Err(e)) => log::error!("{}", e),
            Err(e) => log::error!("HTTP API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    log::info!("maestro exiting");
    Ok(())
}
