//! Main controller implementation.
//!
//! This module contains the `Controller` struct that orchestrates startup
//! and shutdown for the Nexus configuration controller:
//!
//! 1. Resolve the namespace (idle if none can be found)
//! 2. Build and validate the cluster client (abort on failure)
//! 3. Seed the admin credential
//! 4. Reconcile every existing blob store and repository ConfigMap
//! 5. Watch both categories until `stop()`

use crate::bootstrap::reconcile_all;
use crate::config::ControllerConfig;
use crate::credential::{CredentialOutcome, SecurityUpdater, bootstrap_credential};
use crate::error::ControllerError;
use crate::namespace::resolve_namespace;
use crate::reconciler::{CategoryCallback, ConfigReconciler, ResourceCategory, Subscription};
use crate::registry::WatcherRegistry;
use crate::watcher::start_watch;
use cluster_client::{ClusterClient, ClusterConnector};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of one controller run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    /// Started but no namespace could be resolved; nothing runs
    Starting,
    /// Cluster client built and validated
    Configured,
    Running,
}

/// Main controller for Nexus configuration management.
pub struct Controller {
    config: ControllerConfig,
    connector: Arc<dyn ClusterConnector>,
    reconciler: Arc<dyn ConfigReconciler>,
    security: Arc<dyn SecurityUpdater>,
    state: LifecycleState,
    namespace: Option<String>,
    client: Option<Arc<dyn ClusterClient>>,
    registry: Option<WatcherRegistry>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        connector: Arc<dyn ClusterConnector>,
        reconciler: Arc<dyn ConfigReconciler>,
        security: Arc<dyn SecurityUpdater>,
    ) -> Self {
        Self {
            config,
            connector,
            reconciler,
            security,
            state: LifecycleState::Stopped,
            namespace: None,
            client: None,
            registry: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Namespace in use, once resolved
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Watchers still running
    pub fn active_watchers(&self) -> usize {
        self.registry.as_ref().map_or(0, WatcherRegistry::active_count)
    }

    /// Subscriptions in bootstrap order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        ResourceCategory::ALL
            .into_iter()
            .map(|category| Subscription {
                category,
                selector: match category {
                    ResourceCategory::BlobStore => self.config.blobstore_selector.clone(),
                    ResourceCategory::Repository => self.config.repository_selector.clone(),
                },
            })
            .collect()
    }

    /// Run the startup sequence.
    ///
    /// Returns `Ok` both when running and when idle for lack of a
    /// namespace. Fails when the cluster client cannot be built or
    /// validated, or when called while not stopped.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if self.state != LifecycleState::Stopped {
            return Err(ControllerError::InvalidConfig(format!(
                "controller already started (state {:?})",
                self.state
            )));
        }
        self.state = LifecycleState::Starting;
        info!("Starting Nexus configuration controller");

        let Some(resolved) =
            resolve_namespace(&self.config.namespace_file, self.config.namespace_fallback.as_deref()).await
        else {
            warn!("No namespace configured; controller will stay idle");
            return Ok(());
        };
        info!("Using namespace {} from {:?}", resolved.namespace, resolved.source);
        let namespace = resolved.namespace;

        let client = match self.connect().await {
            Ok(client) => client,
            Err(e) => {
                self.state = LifecycleState::Stopped;
                return Err(e);
            }
        };
        self.namespace = Some(namespace.clone());
        self.state = LifecycleState::Configured;

        let outcome =
            bootstrap_credential(client.as_ref(), &namespace, &self.config.credential, self.security.as_ref()).await;
        if let CredentialOutcome::Applied(source) = outcome {
            debug!("Admin password seeded from {:?}", source);
        }

        let subscriptions = self.subscriptions();
        let report = reconcile_all(client.as_ref(), &namespace, &subscriptions, &self.reconciler).await;

        let registry = WatcherRegistry::new();
        for (subscription, listed) in subscriptions.into_iter().zip(&report.categories) {
            let callback = CategoryCallback::new(subscription.category, Arc::clone(&self.reconciler));
            match start_watch(
                Arc::clone(&client),
                namespace.clone(),
                subscription.selector.clone(),
                listed.watch_version().to_string(),
                callback,
                self.config.watch,
            )
            .await
            {
                Ok(handle) => registry.register(handle),
                Err(e) => error!(
                    "Unable to watch {} configurations with selector {}: {}",
                    subscription.category, subscription.selector, e
                ),
            }
        }

        info!("Watching {} categories in namespace {}", registry.len(), namespace);
        self.registry = Some(registry);
        self.client = Some(client);
        self.state = LifecycleState::Running;
        Ok(())
    }

    async fn connect(&self) -> Result<Arc<dyn ClusterClient>, ControllerError> {
        let client = self.connector.connect().await.map_err(|e| {
            error!("Failed to build cluster client: {}", e);
            ControllerError::Cluster(e)
        })?;
        client.validate().await.map_err(|e| {
            error!("Cluster API is not reachable: {}", e);
            ControllerError::Cluster(e)
        })?;
        info!("Cluster client validated");
        Ok(client)
    }

    /// Cancel every watcher and release the cluster client.
    ///
    /// Safe to call repeatedly and without a prior `start()`.
    pub fn stop(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        if let Some(registry) = self.registry.take() {
            registry.stop_all();
        }
        self.client = None;
        self.state = LifecycleState::Stopped;
        info!("Nexus configuration controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        RecordingReconciler, RecordingSecurity, TEST_NAMESPACE, blobstore_selector, labeled, repository_selector,
        test_config,
    };
    use cluster_client::{CredentialMaterial, MockClusterClient, WatchEvent};
    use std::io::Write;
    use std::time::Duration;

    struct Harness {
        mock: MockClusterClient,
        reconciler: Arc<RecordingReconciler>,
        security: Arc<RecordingSecurity>,
        controller: Controller,
        _namespace_file: Option<tempfile::NamedTempFile>,
    }

    fn harness(namespace: Option<&str>) -> Harness {
        let mock = MockClusterClient::new();
        let reconciler = Arc::new(RecordingReconciler::default());
        let security = Arc::new(RecordingSecurity::default());

        let namespace_file = namespace.map(|ns| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "{ns}").unwrap();
            file
        });
        let path = namespace_file
            .as_ref()
            .map_or_else(|| "/nonexistent/namespace".into(), |f| f.path().to_path_buf());

        let controller = Controller::new(
            test_config(path, None),
            Arc::new(mock.clone()),
            reconciler.clone(),
            security.clone(),
        );

        Harness {
            mock,
            reconciler,
            security,
            controller,
            _namespace_file: namespace_file,
        }
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_no_watchers() {
        let mut h = harness(Some(TEST_NAMESPACE));
        let blob_feed = h.mock.watch_feed(&blobstore_selector());
        let repo_feed = h.mock.watch_feed(&repository_selector());

        h.controller.start().await.unwrap();
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.controller.active_watchers(), 2);

        h.controller.stop();

        assert_eq!(h.controller.state(), LifecycleState::Stopped);
        assert_eq!(h.controller.active_watchers(), 0);
        tokio::time::timeout(Duration::from_secs(5), async {
            blob_feed.closed().await;
            repo_feed.closed().await;
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_startup_order() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.mock
            .add_secret(TEST_NAMESPACE, CredentialMaterial::new("nexus").with_field("password", "p1"));
        h.mock.add_resource(labeled("maven", "repository"));
        h.mock.add_resource(labeled("default", "blobstore"));
        let repo_feed = h.mock.watch_feed(&repository_selector());

        h.controller.start().await.unwrap();

        assert_eq!(h.controller.namespace(), Some(TEST_NAMESPACE));
        assert_eq!(h.mock.connect_count(), 1);
        assert_eq!(h.security.calls(), vec![("admin".to_string(), "p1".to_string())]);
        assert_eq!(
            h.reconciler.applied(),
            vec![
                (ResourceCategory::BlobStore, "default".to_string()),
                (ResourceCategory::Repository, "maven".to_string()),
            ]
        );
        let watched: Vec<String> = h.mock.watch_calls().into_iter().map(|call| call.selector).collect();
        assert_eq!(watched, vec!["nexus-type=blobstore", "nexus-type=repository"]);

        repo_feed
            .send(Ok(WatchEvent::Modified(labeled("maven", "repository"))))
            .unwrap();
        h.reconciler.wait_for(3).await;

        h.controller.stop();
    }

    #[tokio::test]
    async fn test_watches_open_at_bootstrap_list_version() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.mock.add_resource(labeled("default", "blobstore"));
        h.mock.set_list_version("4711");
        h.mock.fail_list(&repository_selector());

        h.controller.start().await.unwrap();

        let calls = h.mock.watch_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].selector, "nexus-type=blobstore");
        assert_eq!(calls[0].resource_version, "4711");
        assert_eq!(calls[1].resource_version, cluster_client::ANY_RESOURCE_VERSION);
        assert!(calls.iter().all(|call| call.namespace == TEST_NAMESPACE));

        h.controller.stop();
    }

    #[tokio::test]
    async fn test_no_namespace_builds_no_client() {
        let mut h = harness(None);

        h.controller.start().await.unwrap();

        assert_eq!(h.controller.state(), LifecycleState::Starting);
        assert_eq!(h.mock.connect_count(), 0);
        assert!(h.mock.list_calls().is_empty());

        h.controller.stop();
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_startup() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.mock.fail_validation("connection refused");

        let result = h.controller.start().await;

        assert!(matches!(result, Err(ControllerError::Cluster(_))));
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
        assert!(h.mock.list_calls().is_empty());
        assert!(h.security.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_startup() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.mock.fail_connect("no kubeconfig");

        assert!(h.controller.start().await.is_err());
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_step_failures_still_reach_running() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.mock.fail_secret_lookup();
        h.mock.fail_list(&repository_selector());
        h.mock.fail_watch(&blobstore_selector());

        h.controller.start().await.unwrap();

        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.controller.active_watchers(), 1);
        h.controller.stop();
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let mut h = harness(Some(TEST_NAMESPACE));
        h.controller.start().await.unwrap();

        let second = h.controller.start().await;

        assert!(matches!(second, Err(ControllerError::InvalidConfig(_))));
        assert_eq!(h.mock.connect_count(), 1);
        h.controller.stop();
    }

    #[test]
    fn test_stop_without_start() {
        let mut h = harness(None);

        h.controller.stop();
        h.controller.stop();

        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }
}
