//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes client or API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Client configuration could not be inferred or is invalid
    #[error("Invalid cluster configuration: {0}")]
    Config(String),

    /// Label selector could not be parsed
    #[error("Invalid label selector '{selector}': {reason}")]
    InvalidSelector {
        /// The selector text as given
        selector: String,
        /// Why it was rejected
        reason: String,
    },

    /// The API server answered with an error status, on a call or as a
    /// watch error frame
    #[error("Cluster API error: {0}")]
    Api(String),

    /// The requested resource version is too old to watch from (HTTP 410)
    #[error("Resource version expired: {0}")]
    Expired(String),
}
