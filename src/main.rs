//! Fleet operator daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

mod config;
mod descriptor;
mod discovery;
mod dns;
mod drivers;
mod error;
mod labels;
mod network;
mod operator;
mod reconcile;
mod registry;
mod replace;
mod runtime;
mod types;

use config::Config;
use operator::Operator;
use runtime::DockerEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!("Starting fleet operator with config: {:?}", cfg);

    let engine = DockerEngine::connect(cfg.docker_socket.as_deref(), cfg.docker_timeout_secs)?;
    let operator = Arc::new(Operator::new(Arc::new(engine), cfg));

    // Startup
    operator.check_startup().await?;
    if let Err(e) = operator.wait_for_services().await {
        error!("Waiting for services failed: {}", e);
    }
    match operator.discover_dns().await {
        Ok(()) => {
            if let Err(e) = operator.apply_dns_resolvers().await {
                error!("Applying DNS resolvers failed: {}", e);
            }
        }
        Err(e) => error!("DNS discovery failed, publishing disabled for now: {}", e),
    }
    if let Err(e) = operator.refresh().await {
        error!("Initial refresh failed: {}", e);
    }
    info!(
        "Tracking {} running containers",
        operator.registry().len().await
    );

    // Reconciliation loop
    let loop_handle = tokio::spawn(Arc::clone(&operator).run());

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    loop_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
