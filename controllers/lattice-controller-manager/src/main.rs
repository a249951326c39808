//! Lattice Controller Manager
//!
//! Runs the controllers that turn lattice resources into running workloads:
//! - ComponentBuild, ServiceBuild, SystemBuild: build Jobs and their rollup
//! - Service, System: Deployments, headless Services and per-path Services
//! - SystemRollout, SystemTeardown: serialized lifecycle actions per tenant
//!
//! Configuration is read from the environment (see [`settings::Settings`]).

mod backoff;
mod caches;
mod controller;
mod error;
mod metrics;
mod owner;
mod reconciler;
mod server;
mod settings;
mod shared_config;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::error::ControllerError;
use controller::Controller;
use settings::{LogFormat, Settings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "lattice_controller_manager=info,kube_runtime=warn";

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let settings = Settings::from_env()?;
    init_tracing(settings.log_format);

    info!("Starting Lattice Controller Manager");

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    info!("Configuration:");
    info!(
        "  Config: {}/{}",
        settings.internal_namespace, settings.config_name
    );
    info!(
        "  Namespace: {}",
        settings.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!(
        "  Controllers: {}",
        settings
            .enabled
            .iter()
            .map(|kind| kind.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "  Workers: {}, debounce: {:?}",
        settings.workers, settings.debounce
    );

    let controller = Controller::new(&settings).await?;
    controller.run().await?;

    info!("Lattice Controller Manager stopped");
    Ok(())
}
