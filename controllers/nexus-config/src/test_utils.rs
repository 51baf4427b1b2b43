//! Test utilities for unit testing the engine
//!
//! Fixtures for labeled resources plus recording doubles for the two host
//! capabilities.

use crate::config::{ControllerConfig, CredentialConfig, WatchSettings};
use crate::credential::{SecurityError, SecurityUpdater};
use crate::error::{ControllerError, NexusError};
use crate::reconciler::{ConfigReconciler, ResourceCategory};
use cluster_client::{LabelSelector, LabeledResource};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Namespace used by every fixture
pub const TEST_NAMESPACE: &str = "nexus";

/// Resource in `TEST_NAMESPACE` labeled `nexus-type=<kind>`
pub fn labeled(name: &str, kind: &str) -> LabeledResource {
    LabeledResource::new(name, TEST_NAMESPACE).with_label("nexus-type", kind)
}

pub fn repository_selector() -> LabelSelector {
    "nexus-type==repository".parse().unwrap()
}

pub fn blobstore_selector() -> LabelSelector {
    "nexus-type=blobstore".parse().unwrap()
}

/// Config whose namespace comes from `namespace_file`, else `fallback`
pub fn test_config(namespace_file: PathBuf, fallback: Option<&str>) -> ControllerConfig {
    ControllerConfig {
        namespace_file,
        namespace_fallback: fallback.map(str::to_string),
        repository_selector: repository_selector(),
        blobstore_selector: blobstore_selector(),
        credential: CredentialConfig::default(),
        watch: WatchSettings::default(),
    }
}

/// Records every resource it is asked to reconcile
#[derive(Default)]
pub struct RecordingReconciler {
    applied: Mutex<Vec<(ResourceCategory, LabeledResource)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingReconciler {
    /// Fail (after recording) whenever a resource with this name arrives
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// `(category, name)` of every call, in call order
    pub fn applied(&self) -> Vec<(ResourceCategory, String)> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(category, resource)| (*category, resource.name.clone()))
            .collect()
    }

    /// Full snapshots of every call, in call order
    pub fn snapshots(&self) -> Vec<LabeledResource> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(_, resource)| resource.clone())
            .collect()
    }

    /// Wait until at least `count` calls have been recorded
    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.applied.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler was not called in time");
    }

    fn record(&self, category: ResourceCategory, resource: &LabeledResource) -> Result<(), ControllerError> {
        self.applied.lock().unwrap().push((category, resource.clone()));
        if self.failing.lock().unwrap().contains(&resource.name) {
            return Err(ControllerError::Nexus(NexusError::Api(format!(
                "refused {}",
                resource.name
            ))));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigReconciler for RecordingReconciler {
    async fn on_repository_config(&self, resource: &LabeledResource) -> Result<(), ControllerError> {
        self.record(ResourceCategory::Repository, resource)
    }

    async fn on_blobstore_config(&self, resource: &LabeledResource) -> Result<(), ControllerError> {
        self.record(ResourceCategory::BlobStore, resource)
    }
}

/// How `RecordingSecurity` answers `set_password`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityResponse {
    #[default]
    Accept,
    AccountNotFound,
    Fail,
}

/// Records password changes
#[derive(Default)]
pub struct RecordingSecurity {
    response: SecurityResponse,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingSecurity {
    pub fn responding(response: SecurityResponse) -> Self {
        Self {
            response,
            calls: Mutex::default(),
        }
    }

    /// `(account, password)` of every call
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SecurityUpdater for RecordingSecurity {
    async fn set_password(&self, account: &str, value: &str) -> Result<(), SecurityError> {
        self.calls
            .lock()
            .unwrap()
            .push((account.to_string(), value.to_string()));
        match self.response {
            SecurityResponse::Accept => Ok(()),
            SecurityResponse::AccountNotFound => Err(SecurityError::AccountNotFound(account.to_string())),
            SecurityResponse::Fail => Err(SecurityError::Other("security realm unavailable".to_string())),
        }
    }
}
