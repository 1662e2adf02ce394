mod api;
mod config;
mod error;
mod main_lib;
mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("Invalid configuration")?;
    let state = Arc::new(main_lib::build_state(&config)?);

    let _scheduler = match (&state.sync, config.scheduled_sync) {
        (Some(service), true) => Some(scheduler::spawn_scheduled_sync(
            service.clone(),
            config.sync_interval,
        )),
        (Some(_), false) => {
            info!("[ScheduledSync] Disabled by configuration");
            None
        }
        (None, _) => None,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("edgesync server listening on {}", config.listen_addr);

    axum::serve(listener, api::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
