//! Cluster API Client
//!
//! Namespace-scoped access to the two things the Nexus configuration
//! controller needs from Kubernetes: label-selected `ConfigMap`s (listed once
//! and then watched) and a single named `Secret`.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, KubeClusterClient, LabelSelector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::try_default().await?;
//! client.validate().await?;
//!
//! let selector: LabelSelector = "nexus-type==repository".parse()?;
//! let snapshot = client.list("nexus", &selector).await?;
//! for resource in &snapshot.items {
//!     println!("{} carries {} data fields", resource.name, resource.data.len());
//! }
//!
//! // Changes made after the snapshot
//! let _events = client.watch("nexus", &selector, snapshot.watch_version()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Label selection**: `key==value` / `key=value` selectors shared by list and watch
//! - **Raw watches**: one watch call per subscription, started at the list's
//!   resource version, no implicit re-list
//! - **Secret access**: byte-level credential material with redacted `Debug`
//! - **Mocking**: `MockClusterClient` behind the `test-util` feature

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{KubeClusterClient, KubeConnector, WATCH_SESSION};
pub use error::ClusterError;
pub use models::*;
pub use cluster_trait::{ANY_RESOURCE_VERSION, ClusterClient, ClusterConnector, WatchStream};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, WatchCall};
