//! Controller-specific error types.
//!
//! This module defines error types specific to the Nexus configuration
//! controller that are not covered by upstream library errors.

use cluster_client::ClusterError;
use thiserror::Error;

/// Errors that can occur in the Nexus configuration controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster API or cluster client configuration error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Nexus REST API error
    #[error("Nexus error: {0}")]
    Nexus(#[from] NexusError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that can occur when talking to the Nexus REST API
#[derive(Debug, Error)]
pub enum NexusError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Nexus API returned an error
    #[error("Nexus API error: {0}")]
    Api(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// ConfigMap does not describe a usable blob store or repository
    #[error("Invalid ConfigMap {name}: {reason}")]
    InvalidConfigMap {
        /// `namespace/name` of the ConfigMap
        name: String,
        /// What is wrong with it
        reason: String,
    },
}
