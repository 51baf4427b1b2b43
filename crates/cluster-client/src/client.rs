//! Kubernetes-backed cluster client
//!
//! Implements `ClusterClient` with kube's raw `list` and `watch` calls on
//! `ConfigMap`s and a `get_opt` on `Secret`s.

use crate::cluster_trait::{ClusterClient, ClusterConnector, WatchStream};
use crate::error::ClusterError;
use crate::models::{CredentialMaterial, LabelSelector, LabeledResource, ResourceList, WatchEvent};
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::{Client, Config};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Server-side watch session length; kube rejects 295s and above
const WATCH_TIMEOUT_SECS: u32 = 290;

/// How long the API server keeps one watch open before ending it cleanly
pub const WATCH_SESSION: Duration = Duration::from_secs(WATCH_TIMEOUT_SECS as u64);

/// Status code of a watch whose start version has been compacted away
const GONE: u16 = 410;

/// Cluster client over a kube `Client`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Infer configuration from the pod environment or local kubeconfig.
    ///
    /// The read timeout is removed so watch connections can stay idle
    /// indefinitely.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let mut config = Config::infer()
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        config.read_timeout = None;

        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

/// Map one kube watch frame; bookmarks carry no snapshot and are dropped
fn convert_event(
    frame: Result<KubeWatchEvent<ConfigMap>, kube::Error>,
) -> Option<Result<WatchEvent, ClusterError>> {
    match frame {
        Ok(KubeWatchEvent::Added(cm)) => Some(Ok(WatchEvent::Added(cm.into()))),
        Ok(KubeWatchEvent::Modified(cm)) => Some(Ok(WatchEvent::Modified(cm.into()))),
        Ok(KubeWatchEvent::Deleted(cm)) => Some(Ok(WatchEvent::Deleted(cm.into()))),
        Ok(KubeWatchEvent::Bookmark(_)) => None,
        Ok(KubeWatchEvent::Error(status)) if status.code == GONE => {
            Some(Err(ClusterError::Expired(status.message)))
        }
        Ok(KubeWatchEvent::Error(status)) => Some(Err(ClusterError::Api(format!(
            "watch error {}: {}",
            status.code, status.message
        )))),
        Err(e) => Some(Err(ClusterError::Kube(e))),
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn validate(&self) -> Result<(), ClusterError> {
        let info = self.client.apiserver_version().await?;
        debug!("API server reachable: {}", info.git_version);
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<ResourceList, ClusterError> {
        let selector = selector.to_string();
        debug!("Listing ConfigMaps in {} with selector {}", namespace, selector);

        let list = self
            .config_maps(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;

        Ok(ResourceList::new(
            list.items.into_iter().map(LabeledResource::from).collect(),
            list.metadata.resource_version,
        ))
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        resource_version: &str,
    ) -> Result<WatchStream, ClusterError> {
        let selector = selector.to_string();
        debug!(
            "Watching ConfigMaps in {} with selector {} from version {}",
            namespace, selector, resource_version
        );

        let params = WatchParams::default()
            .labels(&selector)
            .timeout(WATCH_TIMEOUT_SECS);
        let frames = self
            .config_maps(namespace)
            .watch(&params, resource_version)
            .await?;

        Ok(frames
            .filter_map(|frame| future::ready(convert_event(frame)))
            .boxed())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CredentialMaterial>, ClusterError> {
        debug!("Reading Secret {}/{}", namespace, name);
        let secret = self.secrets(namespace).get_opt(name).await?;
        Ok(secret.map(CredentialMaterial::from))
    }
}

/// Connects with `KubeClusterClient::try_default`
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let client = KubeClusterClient::try_default().await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("nexus".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_convert_event_preserves_tags() {
        let added = convert_event(Ok(KubeWatchEvent::Added(config_map("a"))));
        let modified = convert_event(Ok(KubeWatchEvent::Modified(config_map("b"))));
        let deleted = convert_event(Ok(KubeWatchEvent::Deleted(config_map("c"))));

        assert!(matches!(added, Some(Ok(WatchEvent::Added(r))) if r.name == "a"));
        assert!(matches!(modified, Some(Ok(WatchEvent::Modified(r))) if r.name == "b"));
        assert!(matches!(deleted, Some(Ok(WatchEvent::Deleted(r))) if r.name == "c"));
    }

    #[test]
    fn test_error_frames() {
        let frame = |code: u16, message: &str| {
            Ok(KubeWatchEvent::Error(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: message.to_string(),
                reason: String::new(),
                code,
            }))
        };

        let expired = convert_event(frame(410, "too old resource version: 7 (12)"));
        let refused = convert_event(frame(500, "etcd unavailable"));

        assert!(matches!(expired, Some(Err(ClusterError::Expired(m))) if m.starts_with("too old")));
        assert!(matches!(refused, Some(Err(ClusterError::Api(m))) if m == "watch error 500: etcd unavailable"));
    }
}
