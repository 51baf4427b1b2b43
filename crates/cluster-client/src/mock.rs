//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of `ClusterClient` (and
//! `ClusterConnector`) that can be used in unit tests without a running
//! cluster. Watch streams are fed through channels handed out by
//! `watch_feed`, so tests control exactly which events arrive and when the
//! peer "closes" the stream.

use crate::cluster_trait::{ClusterClient, ClusterConnector, WatchStream};
use crate::error::ClusterError;
use crate::models::{CredentialMaterial, LabelSelector, LabeledResource, ResourceList, WatchEvent};
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Sending half of a mock watch stream
pub type WatchFeed = mpsc::UnboundedSender<Result<WatchEvent, ClusterError>>;

type FeedReceiver = mpsc::UnboundedReceiver<Result<WatchEvent, ClusterError>>;

/// One recorded `watch` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCall {
    /// Namespace watched
    pub namespace: String,
    /// Selector, rendered
    pub selector: String,
    /// Resource version the watch started from
    pub resource_version: String,
}

#[derive(Default)]
struct MockState {
    resources: Vec<LabeledResource>,
    list_version: Option<String>,
    failing_lists: HashSet<String>,
    failing_watches: HashSet<String>,
    feeds: HashMap<String, Vec<FeedReceiver>>,
    secrets: HashMap<(String, String), CredentialMaterial>,
    fail_secret_lookup: bool,
    validation_error: Option<String>,
    connect_error: Option<String>,
    list_calls: Vec<(String, String)>,
    watch_calls: Vec<WatchCall>,
    connect_calls: usize,
}

/// Mock cluster for testing
///
/// Clones share state, so a test can keep one handle for setup and
/// assertions while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a resource; `list` returns stored resources in insertion order
    pub fn add_resource(&self, resource: LabeledResource) {
        self.state().resources.push(resource);
    }

    /// Resource version reported by every `list` snapshot
    pub fn set_list_version(&self, version: &str) {
        self.state().list_version = Some(version.to_string());
    }

    /// Make `list` fail for this selector
    pub fn fail_list(&self, selector: &LabelSelector) {
        self.state().failing_lists.insert(selector.to_string());
    }

    /// Make `watch` fail to open for this selector
    pub fn fail_watch(&self, selector: &LabelSelector) {
        self.state().failing_watches.insert(selector.to_string());
    }

    /// Queue a stream for the next `watch` call on this selector.
    ///
    /// Each call queues one more stream, consumed in order by successive
    /// `watch` calls. Dropping the returned sender ends that stream; once
    /// the watcher drops the stream, `WatchFeed::is_closed` turns true.
    /// A `watch` with no queued stream gets one that never yields.
    pub fn watch_feed(&self, selector: &LabelSelector) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .feeds
            .entry(selector.to_string())
            .or_default()
            .push(rx);
        tx
    }

    /// Store a secret in `namespace`
    pub fn add_secret(&self, namespace: &str, material: CredentialMaterial) {
        self.state()
            .secrets
            .insert((namespace.to_string(), material.name().to_string()), material);
    }

    /// Make every `get_secret` call fail
    pub fn fail_secret_lookup(&self) {
        self.state().fail_secret_lookup = true;
    }

    /// Make `validate` fail with `message`
    pub fn fail_validation(&self, message: &str) {
        self.state().validation_error = Some(message.to_string());
    }

    /// Make `connect` fail with `message`
    pub fn fail_connect(&self, message: &str) {
        self.state().connect_error = Some(message.to_string());
    }

    /// `(namespace, selector)` of every `list` call so far
    pub fn list_calls(&self) -> Vec<(String, String)> {
        self.state().list_calls.clone()
    }

    /// Every `watch` call so far, in call order
    pub fn watch_calls(&self) -> Vec<WatchCall> {
        self.state().watch_calls.clone()
    }

    /// Number of `connect` calls so far
    pub fn connect_count(&self) -> usize {
        self.state().connect_calls
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn validate(&self) -> Result<(), ClusterError> {
        match &self.state().validation_error {
            Some(message) => Err(ClusterError::Config(message.clone())),
            None => Ok(()),
        }
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<ResourceList, ClusterError> {
        let mut state = self.state();
        let key = selector.to_string();
        state.list_calls.push((namespace.to_string(), key.clone()));

        if state.failing_lists.contains(&key) {
            return Err(ClusterError::Api(format!("list {key} refused")));
        }

        let items = state
            .resources
            .iter()
            .filter(|r| r.namespace.as_deref() == Some(namespace))
            .filter(|r| selector.matches(&r.labels))
            .cloned()
            .collect();
        Ok(ResourceList::new(items, state.list_version.clone()))
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        resource_version: &str,
    ) -> Result<WatchStream, ClusterError> {
        let mut state = self.state();
        let key = selector.to_string();
        state.watch_calls.push(WatchCall {
            namespace: namespace.to_string(),
            selector: key.clone(),
            resource_version: resource_version.to_string(),
        });

        if state.failing_watches.contains(&key) {
            return Err(ClusterError::Api(format!("watch {key} refused")));
        }

        let queued = state
            .feeds
            .get_mut(&key)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));

        Ok(match queued {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => stream::pending::<Result<WatchEvent, ClusterError>>().boxed(),
        })
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CredentialMaterial>, ClusterError> {
        let state = self.state();
        if state.fail_secret_lookup {
            return Err(ClusterError::Api(format!("get secret {name} refused")));
        }
        Ok(state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[async_trait::async_trait]
impl ClusterConnector for MockClusterClient {
    async fn connect(&self) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let mut state = self.state();
        state.connect_calls += 1;
        if let Some(message) = &state.connect_error {
            return Err(ClusterError::Config(message.clone()));
        }
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}
