//! ClusterClient trait for mocking
//!
//! This trait abstracts the cluster API so the controller can be driven by an
//! in-memory mock in unit tests. The kube-backed `KubeClusterClient`
//! implements it for real clusters.

use crate::error::ClusterError;
use crate::models::{CredentialMaterial, LabelSelector, ResourceList, WatchEvent};
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazily produced, effectively infinite sequence of change events.
///
/// A stream cannot be restarted; a fresh `watch` call is the only way to
/// resume after it ends.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Watch start point that accepts any cached state
pub const ANY_RESOURCE_VERSION: &str = "0";

/// Namespace-scoped cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Trivial reachability check against the API server
    async fn validate(&self) -> Result<(), ClusterError>;

    /// List every resource in `namespace` matching `selector`, in API order,
    /// together with the resource version of the snapshot
    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<ResourceList, ClusterError>;

    /// Open one streaming watch for resources in `namespace` matching
    /// `selector`, delivering changes after `resource_version`.
    ///
    /// `ANY_RESOURCE_VERSION` replays every current object as ADDED first.
    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        resource_version: &str,
    ) -> Result<WatchStream, ClusterError>;

    /// Read a named secret; `Ok(None)` when it does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CredentialMaterial>, ClusterError>;
}

/// Builds a `ClusterClient` from ambient configuration
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Construct a client; fails when no usable configuration exists
    async fn connect(&self) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}
