//! Reconciler capability and event policy.
//!
//! The host supplies a `ConfigReconciler` that turns one labeled ConfigMap
//! into a blob store or repository. The engine only decides which callback a
//! resource goes to and what a watch event means for it.

use crate::error::ControllerError;
use cluster_client::{LabelSelector, LabeledResource, WatchEventKind};
use std::fmt;
use std::sync::Arc;

/// Host-supplied provisioning for the two resource categories.
///
/// Implementations must be idempotent for identical resource content: the
/// bootstrap list and the first watch events usually deliver the same
/// objects. Both methods may run concurrently, one call per category at a
/// time at most.
#[async_trait::async_trait]
pub trait ConfigReconciler: Send + Sync {
    /// Ensure the repository described by `resource` exists and matches it
    async fn on_repository_config(&self, resource: &LabeledResource) -> Result<(), ControllerError>;

    /// Ensure the blob store described by `resource` exists and matches it
    async fn on_blobstore_config(&self, resource: &LabeledResource) -> Result<(), ControllerError>;
}

/// The two kinds of labeled configuration the engine manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    BlobStore,
    Repository,
}

impl ResourceCategory {
    /// Bootstrap order: repositories reference blob stores by name
    pub const ALL: [Self; 2] = [Self::BlobStore, Self::Repository];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlobStore => "blobstore",
            Self::Repository => "repository",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category paired with the selector used to both list and watch it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub category: ResourceCategory,
    pub selector: LabelSelector,
}

/// Routes resources of one category to the matching reconciler method
#[derive(Clone)]
pub struct CategoryCallback {
    category: ResourceCategory,
    reconciler: Arc<dyn ConfigReconciler>,
}

impl fmt::Debug for CategoryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategoryCallback")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl CategoryCallback {
    pub fn new(category: ResourceCategory, reconciler: Arc<dyn ConfigReconciler>) -> Self {
        Self { category, reconciler }
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    /// Hand `resource` to the reconciler method for this category
    pub async fn apply(&self, resource: &LabeledResource) -> Result<(), ControllerError> {
        match self.category {
            ResourceCategory::BlobStore => self.reconciler.on_blobstore_config(resource).await,
            ResourceCategory::Repository => self.reconciler.on_repository_config(resource).await,
        }
    }
}

/// What the engine does with the snapshot carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Ensure the local resource exists and matches the snapshot
    Upsert,
}

/// Map a watch event tag to an action.
///
/// Deletions re-apply the last snapshot; nothing is ever removed from Nexus
/// when its ConfigMap goes away.
#[allow(clippy::match_same_arms, reason = "DELETED upserts on purpose")]
pub fn action_for(kind: WatchEventKind) -> ReconcileAction {
    match kind {
        WatchEventKind::Added | WatchEventKind::Modified => ReconcileAction::Upsert,
        WatchEventKind::Deleted => ReconcileAction::Upsert,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingReconciler, labeled};

    #[test]
    fn test_every_event_kind_upserts() {
        assert_eq!(action_for(WatchEventKind::Added), ReconcileAction::Upsert);
        assert_eq!(action_for(WatchEventKind::Modified), ReconcileAction::Upsert);
        assert_eq!(action_for(WatchEventKind::Deleted), ReconcileAction::Upsert);
    }

    #[test]
    fn test_blobstores_bootstrap_first() {
        assert_eq!(ResourceCategory::ALL[0], ResourceCategory::BlobStore);
        assert_eq!(ResourceCategory::ALL[1], ResourceCategory::Repository);
    }

    #[tokio::test]
    async fn test_callback_routes_by_category() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let blobstores = CategoryCallback::new(ResourceCategory::BlobStore, reconciler.clone());
        let repositories = CategoryCallback::new(ResourceCategory::Repository, reconciler.clone());

        blobstores.apply(&labeled("default", "blobstore")).await.unwrap();
        repositories.apply(&labeled("maven", "repository")).await.unwrap();

        assert_eq!(
            reconciler.applied(),
            vec![
                (ResourceCategory::BlobStore, "default".to_string()),
                (ResourceCategory::Repository, "maven".to_string()),
            ]
        );
    }
}
