//! Cluster resource models
//!
//! Plain snapshots of the objects the controller reads. Nothing here holds a
//! connection or a reference back into the cluster.

use crate::cluster_trait::ANY_RESOURCE_VERSION;
use crate::error::ClusterError;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A labeled configuration object fetched from the cluster.
///
/// Snapshots are immutable once received; reconcilers read labels and data
/// and never write back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabeledResource {
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// String data fields (`ConfigMap.data`)
    pub data: BTreeMap<String, String>,
    /// Resource version at snapshot time
    pub resource_version: Option<String>,
}

impl LabeledResource {
    /// Create an empty resource with the given identity
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Add a label (builder style)
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a data field (builder style)
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the resource version (builder style)
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    /// Look up a label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Look up a data field
    pub fn data_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// `namespace/name`, or just `name` for cluster-scoped snapshots
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl From<ConfigMap> for LabeledResource {
    fn from(config_map: ConfigMap) -> Self {
        let metadata = config_map.metadata;
        Self {
            name: metadata.name.unwrap_or_default(),
            namespace: metadata.namespace,
            labels: metadata.labels.unwrap_or_default(),
            data: config_map.data.unwrap_or_default(),
            resource_version: metadata.resource_version,
        }
    }
}

/// Result of one list call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceList {
    /// Matching objects, in API order
    pub items: Vec<LabeledResource>,
    /// Resource version of the list snapshot (`ListMeta.resourceVersion`)
    pub resource_version: Option<String>,
}

impl ResourceList {
    /// Build a snapshot from items and its resource version
    pub fn new(items: Vec<LabeledResource>, resource_version: Option<String>) -> Self {
        Self {
            items,
            resource_version,
        }
    }

    /// Version a watch should start from to see only later changes.
    ///
    /// Falls back to `ANY_RESOURCE_VERSION` when the server sent none.
    pub fn watch_version(&self) -> &str {
        self.resource_version
            .as_deref()
            .filter(|version| !version.is_empty())
            .unwrap_or(ANY_RESOURCE_VERSION)
    }
}

/// An equality-based label selector.
///
/// Accepts `key==value` and `key=value` clauses joined by commas (logical
/// AND). Both spellings normalise to the same requirements, so a selector
/// parsed once can back both the list and the watch of a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

impl LabelSelector {
    /// Selector with a single `key=value` requirement
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![(key.into(), value.into())],
        }
    }

    /// The `(key, value)` requirements, in declaration order
    pub fn requirements(&self) -> &[(String, String)] {
        &self.requirements
    }

    /// Whether every requirement is satisfied by `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl FromStr for LabelSelector {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClusterError::InvalidSelector {
            selector: s.to_string(),
            reason: reason.to_string(),
        };

        let mut requirements = Vec::new();
        for clause in s.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                return Err(invalid("empty clause"));
            }
            if clause.contains("!=") {
                return Err(invalid("only equality requirements are supported"));
            }
            let (key, value) = clause
                .split_once("==")
                .or_else(|| clause.split_once('='))
                .ok_or_else(|| invalid("expected key==value or key=value"))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(invalid("empty key"));
            }
            if key.contains('=') || value.contains('=') {
                return Err(invalid("unexpected '='"));
            }
            requirements.push((key.to_string(), value.to_string()));
        }

        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .requirements
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&rendered)
    }
}

/// Tag of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// Object created, or replayed by a watch from `ANY_RESOURCE_VERSION`
    Added,
    /// Object changed
    Modified,
    /// Object removed
    Deleted,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        })
    }
}

/// A change notification carrying the resource snapshot at event time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Object created, with its snapshot
    Added(LabeledResource),
    /// Object changed, with the new snapshot
    Modified(LabeledResource),
    /// Object removed, with its last snapshot
    Deleted(LabeledResource),
}

impl WatchEvent {
    /// The event tag
    pub fn kind(&self) -> WatchEventKind {
        match self {
            Self::Added(_) => WatchEventKind::Added,
            Self::Modified(_) => WatchEventKind::Modified,
            Self::Deleted(_) => WatchEventKind::Deleted,
        }
    }

    /// The snapshot carried by the event
    pub fn resource(&self) -> &LabeledResource {
        match self {
            Self::Added(resource) | Self::Modified(resource) | Self::Deleted(resource) => resource,
        }
    }

    /// Consume the event, keeping the snapshot
    pub fn into_resource(self) -> LabeledResource {
        match self {
            Self::Added(resource) | Self::Modified(resource) | Self::Deleted(resource) => resource,
        }
    }
}

/// Raw field material read from a single credential object.
///
/// Values are bytes as stored by the cluster. `Debug` prints field names only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMaterial {
    name: String,
    fields: BTreeMap<String, Vec<u8>>,
}

impl CredentialMaterial {
    /// Create empty material for the named credential object
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field (builder style)
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Name of the credential object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw bytes of a field
    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    /// A field decoded as UTF-8; `None` if missing or not valid UTF-8
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Field names, sorted
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("name", &self.name)
            .field("keys", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl From<Secret> for CredentialMaterial {
    fn from(secret: Secret) -> Self {
        let mut material = Self::new(secret.metadata.name.unwrap_or_default());
        // stringData is write-only on the API server, but fixtures and
        // dry-run objects may still carry it
        for (key, value) in secret.string_data.unwrap_or_default() {
            material.fields.insert(key, value.into_bytes());
        }
        for (key, value) in secret.data.unwrap_or_default() {
            material.fields.insert(key, value.0);
        }
        material
    }
}
