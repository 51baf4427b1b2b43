//! Admin credential bootstrap.
//!
//! One-shot startup step: read the `nexus` secret and seed the admin
//! password from it. Every failure here is logged and swallowed.

use crate::config::CredentialConfig;
use cluster_client::{ClusterClient, CredentialMaterial};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the host's security subsystem
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The account does not exist
    #[error("User '{0}' not found")]
    AccountNotFound(String),

    /// Any other failure
    #[error("Security update failed: {0}")]
    Other(String),
}

/// Host capability that changes an account's password
#[async_trait::async_trait]
pub trait SecurityUpdater: Send + Sync {
    async fn set_password(&self, account: &str, value: &str) -> Result<(), SecurityError>;
}

/// Which link of the fallback chain produced the password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    SecretField,
    Environment,
    Default,
}

/// Result of the bootstrap step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    Applied(PasswordSource),
    /// The secret does not exist
    Skipped,
    AccountNotFound,
    Failed,
}

/// Pick the password: secret field, then fallback variable, then default.
///
/// A field that is not valid UTF-8 counts as absent.
pub fn resolve_password<'a>(
    material: Option<&'a CredentialMaterial>,
    config: &'a CredentialConfig,
) -> (&'a str, PasswordSource) {
    if let Some(value) = material.and_then(|m| m.field_str(&config.password_field)) {
        return (value, PasswordSource::SecretField);
    }
    match config.password_fallback.as_deref() {
        Some(value) => (value, PasswordSource::Environment),
        None => (config.default_password.as_str(), PasswordSource::Default),
    }
}

/// Seed the admin password from the credential secret in `namespace`
pub async fn bootstrap_credential(
    client: &dyn ClusterClient,
    namespace: &str,
    config: &CredentialConfig,
    security: &dyn SecurityUpdater,
) -> CredentialOutcome {
    let material = match client.get_secret(namespace, &config.secret_name).await {
        Ok(Some(material)) => material,
        Ok(None) => {
            info!("Unable to retrieve secret '{}' from namespace {}", config.secret_name, namespace);
            return CredentialOutcome::Skipped;
        }
        Err(e) => {
            warn!("An error occurred while retrieving secret '{}': {}", config.secret_name, e);
            return CredentialOutcome::Failed;
        }
    };

    debug!(
        "Secret '{}' retrieved with keys {:?}",
        material.name(),
        material.keys().collect::<Vec<_>>()
    );

    let (password, source) = resolve_password(Some(&material), config);
    debug!("Setting password for '{}' from {:?}", config.account, source);

    match security.set_password(&config.account, password).await {
        Ok(()) => {
            info!("Password for '{}' successfully set", config.account);
            CredentialOutcome::Applied(source)
        }
        Err(SecurityError::AccountNotFound(account)) => {
            warn!("User '{}' not found, unable to set password", account);
            CredentialOutcome::AccountNotFound
        }
        Err(e) => {
            warn!("Unable to set password for '{}': {}", config.account, e);
            CredentialOutcome::Failed
        }
    }
}
