use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::server::{MonitorDependencies, MonitorServer};
use crate::sink::LoggingSink;

use super::cert;
use super::config::{check_config, expand_path, resolve_run_config};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run {
            config,
            port,
            backend,
            json,
        } => {
            run_monitor(config.as_deref(), *port, backend.as_deref(), *json).await?;
        }
        Commands::Check { config } => {
            let config_path = expand_path(config)?;
            check_config(&config_path)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// Run the monitor until Ctrl+C
async fn run_monitor(
    config: Option<&str>,
    port: Option<u16>,
    backend: Option<&str>,
    json: bool,
) -> Result<()> {
    if let Some(path) = config {
        info!("Loading monitor configuration from: {}", path);
    }
    let monitor_config = resolve_run_config(config, port, backend)?;

    let sink = Arc::new(LoggingSink::new().with_json(json));
    let deps = MonitorDependencies::from_config(&monitor_config)?
        .with_record_sink(sink.clone())
        .with_failure_sink(sink);

    let handle = MonitorServer::start(&monitor_config, deps).await?;
    info!(
        "Monitoring {} -> {} (Press Ctrl+C to stop)",
        handle.local_addr(),
        handle.backend_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received shutdown signal, waiting for active sessions...");

    let snapshot = handle.close().await?;
    info!(
        "Monitor stopped gracefully: {} sessions, {} recorded, {} failed, {} accept errors",
        snapshot.total_sessions,
        snapshot.completed_sessions,
        snapshot.failed_sessions,
        snapshot.accept_errors
    );

    Ok(())
}
