use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::services::build_services;
use crate::core::config::ForgeConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::{ApiServer, ApiServerConfig};

/// Daemon mode: admin API plus the cron-driven scheduler tick, until Ctrl+C.
pub(crate) async fn run_daemon(
    config: ForgeConfig,
    log_tx: tokio::sync::broadcast::Sender<String>,
) -> Result<()> {
    let services = build_services(config).await?;
    let mut lifecycle = LifecycleManager::new().await?;
    let shutdown = CancellationToken::new();

    lifecycle.attach(Arc::new(Mutex::new(services.store.clone())));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        ApiServerConfig {
            store: services.store.clone(),
            runner: services.runner.clone(),
            scheduler: services.scheduler.clone(),
            log_tx,
            api_host: services.config.api_host.clone(),
            api_port: services.config.api_port,
            admin_token: services.config.admin_token.clone(),
        },
        shutdown.clone(),
    ))));
    services.scheduler.install(&lifecycle.scheduler).await?;
    lifecycle.start().await?;

    let base = format!(
        "http://{}:{}",
        services.config.api_host, services.config.api_port
    );
    terminal::print_banner();
    terminal::print_link("Admin API", &format!("{}/api", base));
    terminal::print_link("Logs", &format!("{}/api/logs", base));
    GuideSection::new("Forge daemon")
        .status("Data dir", &services.config.data_dir.display().to_string())
        .status(
            "Scheduler",
            &if services.config.scheduler.enabled {
                format!(
                    "{} (window {} min after local midnight)",
                    services.config.scheduler.timezone,
                    services.config.scheduler.trigger_window_minutes
                )
            } else {
                "disabled".to_string()
            },
        )
        .status(
            "Admin auth",
            if services.config.admin_token.is_some() {
                "bearer token"
            } else {
                "loopback only"
            },
        )
        .hint("Press Ctrl+C to stop.")
        .print();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down forge daemon...");
    lifecycle.shutdown().await?;
    shutdown.cancel();
    Ok(())
}
