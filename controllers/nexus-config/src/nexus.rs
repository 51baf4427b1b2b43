//! Nexus REST client
//!
//! Implements both host capabilities on top of the Nexus 3 REST API:
//! blob store / repository upserts driven by ConfigMaps
//! (`/service/rest/v1/blobstores`, `/service/rest/v1/repositories`) and the
//! admin password change (`/service/rest/v1/security/users`).
//!
//! A ConfigMap describes its resource as JSON under the `config` data key.
//! Routing fields (`type`, plus `format` for repositories) pick the endpoint
//! and are stripped; everything else is sent as the request body.

use crate::config::NexusConfig;
use crate::credential::{SecurityError, SecurityUpdater};
use crate::error::{ControllerError, NexusError};
use crate::reconciler::ConfigReconciler;
use cluster_client::LabeledResource;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// ConfigMap data key holding the JSON description
pub const CONFIG_KEY: &str = "config";

const API_BASE: &str = "/service/rest/v1";
const DEFAULT_BLOBSTORE_TYPE: &str = "file";

/// Blob store described by a ConfigMap
#[derive(Debug, Clone, PartialEq)]
pub struct BlobStoreSpec {
    pub name: String,
    pub store_type: String,
    pub body: Value,
}

impl BlobStoreSpec {
    /// Parse the `config` key. `name` defaults to the ConfigMap name and
    /// `type` to `file`.
    pub fn from_resource(resource: &LabeledResource) -> Result<Self, NexusError> {
        let mut document = parse_document(resource)?;
        let store_type = take_string(&mut document, "type").unwrap_or_else(|| DEFAULT_BLOBSTORE_TYPE.to_string());
        let name = match document.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                document.insert("name".to_string(), Value::String(resource.name.clone()));
                resource.name.clone()
            }
        };

        Ok(Self {
            name,
            store_type,
            body: Value::Object(document),
        })
    }
}

/// Repository described by a ConfigMap
#[derive(Debug, Clone, PartialEq)]
pub struct RepositorySpec {
    pub name: String,
    /// `maven2`, `docker`, `npm`, ...
    pub format: String,
    /// `hosted`, `proxy` or `group`
    pub repository_type: String,
    pub body: Value,
}

impl RepositorySpec {
    /// Parse the `config` key; `name`, `format` and `type` are required
    pub fn from_resource(resource: &LabeledResource) -> Result<Self, NexusError> {
        let mut document = parse_document(resource)?;
        let format = take_string(&mut document, "format").ok_or_else(|| invalid(resource, "missing 'format'"))?;
        let repository_type = take_string(&mut document, "type").ok_or_else(|| invalid(resource, "missing 'type'"))?;
        if !matches!(repository_type.as_str(), "hosted" | "proxy" | "group") {
            return Err(invalid(
                resource,
                &format!("unknown repository type '{repository_type}'"),
            ));
        }
        let name = document
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(resource, "missing 'name'"))?;

        Ok(Self {
            name,
            format,
            repository_type,
            body: Value::Object(document),
        })
    }
}

fn invalid(resource: &LabeledResource, reason: &str) -> NexusError {
    NexusError::InvalidConfigMap {
        name: resource.qualified_name(),
        reason: reason.to_string(),
    }
}

fn parse_document(resource: &LabeledResource) -> Result<Map<String, Value>, NexusError> {
    let raw = resource
        .data_field(CONFIG_KEY)
        .ok_or_else(|| invalid(resource, &format!("no '{CONFIG_KEY}' data key")))?;
    match serde_json::from_str(raw) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(invalid(resource, "config is not a JSON object")),
        Err(e) => Err(invalid(resource, &format!("config is not valid JSON: {e}"))),
    }
}

fn take_string(document: &mut Map<String, Value>, key: &str) -> Option<String> {
    match document.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

fn blob_stores_path(store_type: &str) -> String {
    format!("{API_BASE}/blobstores/{}", encode(store_type))
}

fn blob_store_path(store_type: &str, name: &str) -> String {
    format!("{}/{}", blob_stores_path(store_type), encode(name))
}

fn repository_path(name: &str) -> String {
    format!("{API_BASE}/repositories/{}", encode(name))
}

fn repository_kind_path(format: &str, repository_type: &str) -> String {
    format!("{API_BASE}/repositories/{}/{}", encode(format), encode(repository_type))
}

fn change_password_path(account: &str) -> String {
    format!("{API_BASE}/security/users/{}/change-password", encode(account))
}

/// Nexus API client
pub struct NexusClient {
    client: Client,
    base_url: String,
    username: String,
    /// Replaced whenever the client changes its own account's password
    password: RwLock<String>,
}

impl std::fmt::Debug for NexusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NexusClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl NexusClient {
    /// Create a new Nexus client
    pub fn new(config: &NexusConfig) -> Result<Self, NexusError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: RwLock::new(config.password.clone()),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let password = self.password.read().unwrap_or_else(PoisonError::into_inner);
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(password.as_str()))
            .header("Accept", "application/json")
    }

    async fn exists(&self, path: &str) -> Result<bool, NexusError> {
        debug!("Looking up {}", path);
        let response = self.request(Method::GET, path).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NexusError::Api(format!("GET {path}: {status} - {body}")));
        }
        Ok(true)
    }

    async fn check(method: &Method, path: &str, response: reqwest::Response) -> Result<(), NexusError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(NexusError::NotFound(path.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(NexusError::Api(format!("{method} {path}: {status} - {body}")))
    }

    async fn send_json(&self, method: Method, path: &str, body: &Value) -> Result<(), NexusError> {
        debug!("{} {}", method, path);
        let response = self.request(method.clone(), path).json(body).send().await?;
        Self::check(&method, path, response).await
    }

    /// Create the blob store, or update it when it already exists
    pub async fn upsert_blob_store(&self, spec: &BlobStoreSpec) -> Result<(), NexusError> {
        let existing = blob_store_path(&spec.store_type, &spec.name);
        if self.exists(&existing).await? {
            self.send_json(Method::PUT, &existing, &spec.body).await
        } else {
            self.send_json(Method::POST, &blob_stores_path(&spec.store_type), &spec.body)
                .await
        }
    }

    /// Create the repository, or update it when it already exists
    pub async fn upsert_repository(&self, spec: &RepositorySpec) -> Result<(), NexusError> {
        let kind = repository_kind_path(&spec.format, &spec.repository_type);
        if self.exists(&repository_path(&spec.name)).await? {
            let existing = format!("{kind}/{}", encode(&spec.name));
            self.send_json(Method::PUT, &existing, &spec.body).await
        } else {
            self.send_json(Method::POST, &kind, &spec.body).await
        }
    }

    /// Change `account`'s password. The value is never logged.
    ///
    /// When `account` is the one this client authenticates as, later
    /// requests use the new password.
    pub async fn change_password(&self, account: &str, value: &str) -> Result<(), NexusError> {
        let path = change_password_path(account);
        debug!("PUT {}", path);
        let response = self
            .request(Method::PUT, &path)
            .header("Content-Type", "text/plain")
            .body(value.to_string())
            .send()
            .await?;
        Self::check(&Method::PUT, &path, response).await?;

        if account == self.username {
            *self.password.write().unwrap_or_else(PoisonError::into_inner) = value.to_string();
            debug!("Client credentials for '{}' updated", account);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigReconciler for NexusClient {
    async fn on_repository_config(&self, resource: &LabeledResource) -> Result<(), ControllerError> {
        let spec = RepositorySpec::from_resource(resource)?;
        self.upsert_repository(&spec).await?;
        info!(
            "Repository '{}' ({} {}) reconciled from {}",
            spec.name,
            spec.format,
            spec.repository_type,
            resource.qualified_name()
        );
        Ok(())
    }

    async fn on_blobstore_config(&self, resource: &LabeledResource) -> Result<(), ControllerError> {
        let spec = BlobStoreSpec::from_resource(resource)?;
        self.upsert_blob_store(&spec).await?;
        info!(
            "Blob store '{}' ({}) reconciled from {}",
            spec.name,
            spec.store_type,
            resource.qualified_name()
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecurityUpdater for NexusClient {
    async fn set_password(&self, account: &str, value: &str) -> Result<(), SecurityError> {
        match self.change_password(account, value).await {
            Ok(()) => Ok(()),
            Err(NexusError::NotFound(_)) => Err(SecurityError::AccountNotFound(account.to_string())),
            Err(e) => Err(SecurityError::Other(e.to_string())),
        }
    }
}
