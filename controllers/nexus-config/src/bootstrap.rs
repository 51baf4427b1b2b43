//! Initial reconciliation.
//!
//! Before any watch is opened, every currently existing resource of each
//! category is listed once and handed to its callback.

use crate::reconciler::{CategoryCallback, ConfigReconciler, ResourceCategory, Subscription};
use cluster_client::{ANY_RESOURCE_VERSION, ClusterClient, LabelSelector};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened while bootstrapping one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: ResourceCategory,
    /// Resources returned by the list call
    pub listed: usize,
    pub applied: usize,
    pub failed: usize,
    /// Set when the list call itself failed
    pub list_error: Option<String>,
    /// Collection version of the list snapshot
    pub resource_version: Option<String>,
}

impl CategoryReport {
    fn empty(category: ResourceCategory) -> Self {
        Self {
            category,
            listed: 0,
            applied: 0,
            failed: 0,
            list_error: None,
            resource_version: None,
        }
    }

    /// Version the category's watch should start from
    pub fn watch_version(&self) -> &str {
        self.resource_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(ANY_RESOURCE_VERSION)
    }
}

/// Per-category reports, in bootstrap order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub categories: Vec<CategoryReport>,
}

impl BootstrapReport {
    pub fn applied(&self) -> usize {
        self.categories.iter().map(|c| c.applied).sum()
    }

    pub fn failed(&self) -> usize {
        self.categories.iter().map(|c| c.failed).sum()
    }
}

/// List `selector` in `namespace` and apply `callback` once per resource.
///
/// A failed list is logged and reported, never propagated. A failing callback
/// does not stop the remaining resources.
pub async fn reconcile_category(
    client: &dyn ClusterClient,
    namespace: &str,
    selector: &LabelSelector,
    callback: &CategoryCallback,
) -> CategoryReport {
    let category = callback.category();
    let mut report = CategoryReport::empty(category);

    let snapshot = match client.list(namespace, selector).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Unable to list {} configurations with selector {}: {}", category, selector, e);
            report.list_error = Some(e.to_string());
            return report;
        }
    };

    report.listed = snapshot.items.len();
    report.resource_version = snapshot.resource_version;
    debug!(
        "Found {} {} configurations at version {}",
        report.listed,
        category,
        report.watch_version()
    );

    for resource in &snapshot.items {
        match callback.apply(resource).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                report.failed += 1;
                warn!("Failed to apply {} config {}: {}", category, resource.qualified_name(), e);
            }
        }
    }

    report
}

/// Bootstrap every subscription in order
pub async fn reconcile_all(
    client: &dyn ClusterClient,
    namespace: &str,
    subscriptions: &[Subscription],
    reconciler: &Arc<dyn ConfigReconciler>,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();

    for subscription in subscriptions {
        let callback = CategoryCallback::new(subscription.category, Arc::clone(reconciler));
        let category_report = reconcile_category(client, namespace, &subscription.selector, &callback).await;
        report.categories.push(category_report);
    }

    let unlisted = report.categories.iter().filter(|c| c.list_error.is_some()).count();
    info!(
        "Initial reconciliation applied {} configurations ({} failed, {} categories not listed)",
        report.applied(),
        report.failed(),
        unlisted
    );
    report
}
