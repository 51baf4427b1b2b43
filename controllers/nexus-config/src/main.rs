//! Nexus Configuration Controller
//!
//! Keeps a Nexus repository manager in sync with labeled ConfigMaps in the
//! namespace it runs in:
//! - `nexus-type=blobstore`: creates or updates blob stores
//! - `nexus-type=repository`: creates or updates repositories
//!
//! On startup it also seeds the admin password from the `nexus` secret.

mod backoff;
mod bootstrap;
mod config;
mod controller;
mod credential;
mod error;
mod namespace;
mod nexus;
mod reconciler;
mod registry;
mod watcher;
#[cfg(test)]
mod test_utils;

use crate::config::{ControllerConfig, NexusConfig, ReconnectPolicy};
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::credential::SecurityUpdater;
use crate::nexus::NexusClient;
use crate::reconciler::ConfigReconciler;
use cluster_client::KubeConnector;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Nexus Configuration Controller");

    let config = ControllerConfig::from_env()?;
    let nexus_config = NexusConfig::from_env();

    info!("Configuration:");
    info!("  Nexus URL: {}", nexus_config.url);
    info!("  Namespace file: {}", config.namespace_file.display());
    info!("  Blob store selector: {}", config.blobstore_selector);
    info!("  Repository selector: {}", config.repository_selector);
    info!("  Watch session: {:?}", config.watch.session);
    match config.watch.reconnect {
        ReconnectPolicy::Never => info!("  Watch reconnect: disabled"),
        ReconnectPolicy::Backoff { max_attempts } => {
            info!("  Watch reconnect: up to {} attempts", max_attempts);
        }
    }

    let nexus = Arc::new(NexusClient::new(&nexus_config)?);
    let reconciler: Arc<dyn ConfigReconciler> = nexus.clone();
    let security: Arc<dyn SecurityUpdater> = nexus;
    let mut controller = Controller::new(config, Arc::new(KubeConnector), reconciler, security);

    controller.start().await?;
    match controller.namespace() {
        Some(namespace) => info!(
            "Controller {:?} in namespace {} with {} watchers",
            controller.state(),
            namespace,
            controller.active_watchers()
        ),
        None => warn!("Controller idle until restarted with a namespace"),
    }

    shutdown_signal().await;
    controller.stop();

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
