//! Namespace resolution.
//!
//! The namespace to watch comes from the service account mount when it can be
//! read, otherwise from the fallback variable. Resolution happens once.

use std::path::Path;
use tracing::{debug, info, warn};

/// Where the namespace came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceSource {
    File,
    Environment,
}

/// A resolved, non-empty namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNamespace {
    pub namespace: String,
    pub source: NamespaceSource,
}

/// Resolve the namespace from `path`, falling back to `fallback`.
///
/// A missing or unreadable file falls back; so does a file that is empty
/// after trimming. Returns `None` when neither source yields a value, in
/// which case no cluster operation may run.
pub async fn resolve_namespace(path: &Path, fallback: Option<&str>) -> Option<ResolvedNamespace> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let namespace = contents.trim();
            if namespace.is_empty() {
                warn!("Namespace file {} is empty", path.display());
            } else {
                info!("Read namespace '{}' from {}", namespace, path.display());
                return Some(ResolvedNamespace {
                    namespace: namespace.to_string(),
                    source: NamespaceSource::File,
                });
            }
        }
        Err(e) => {
            debug!("Unable to read namespace from {}: {}", path.display(), e);
        }
    }

    match fallback.map(str::trim).filter(|ns| !ns.is_empty()) {
        Some(namespace) => {
            info!("Read namespace '{}' from environment", namespace);
            Some(ResolvedNamespace {
                namespace: namespace.to_string(),
                source: NamespaceSource::Environment,
            })
        }
        None => {
            warn!("Unable to determine namespace from {} or the environment", path.display());
            None
        }
    }
}
