//! Controller configuration.
//!
//! Everything is read once from environment variables at startup. Tests build
//! configs through `from_lookup` with an in-memory map instead of touching the
//! process environment.

use crate::error::ControllerError;
use cluster_client::{LabelSelector, WATCH_SESSION};
use std::path::PathBuf;
use std::time::Duration;

/// Service account mount that names the pod's namespace
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str = "/run/secrets/kubernetes.io/serviceaccount/namespace";
/// Namespace fallback variable
pub const NAMESPACE_ENV: &str = "KUBERNETES_NAMESPACE";
/// Password fallback variable
pub const PASSWORD_ENV: &str = "NEXUS_PASSWORD";

/// Secret holding the initial admin password
pub const CREDENTIAL_SECRET_NAME: &str = "nexus";
/// Field of the secret holding the password
pub const PASSWORD_FIELD: &str = "password";
/// Password used when neither the secret field nor the variable is set
pub const DEFAULT_PASSWORD: &str = "admin123";
/// Account whose password is seeded
pub const ADMIN_ACCOUNT: &str = "admin";

const DEFAULT_REPOSITORY_SELECTOR: &str = "nexus-type==repository";
const DEFAULT_BLOBSTORE_SELECTOR: &str = "nexus-type==blobstore";
const DEFAULT_MAX_RECONNECTS: u32 = 10;
const DEFAULT_NEXUS_URL: &str = "http://localhost:8081";

/// What a watcher does after its stream ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Stop silently; updates resume only after a restart
    #[default]
    Never,
    /// Re-open the watch with Fibonacci backoff, at most `max_attempts`
    /// consecutive times
    Backoff {
        /// Consecutive failed or short-lived re-subscriptions allowed
        max_attempts: u32,
    },
}

/// How each category watcher keeps its stream open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub reconnect: ReconnectPolicy,
    /// Length of one server-side watch session. A stream that lived this
    /// long is renewed in place whatever the reconnect policy says.
    pub session: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            session: WATCH_SESSION,
        }
    }
}

/// Credential bootstrap settings
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub secret_name: String,
    pub password_field: String,
    /// Value of `NEXUS_PASSWORD` at startup, if set
    pub password_fallback: Option<String>,
    pub default_password: String,
    pub account: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secret_name: CREDENTIAL_SECRET_NAME.to_string(),
            password_field: PASSWORD_FIELD.to_string(),
            password_fallback: None,
            default_password: DEFAULT_PASSWORD.to_string(),
            account: ADMIN_ACCOUNT.to_string(),
        }
    }
}

/// Settings for the watch-and-reconcile engine
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub namespace_file: PathBuf,
    /// Value of `KUBERNETES_NAMESPACE` at startup, if set
    pub namespace_fallback: Option<String>,
    pub repository_selector: LabelSelector,
    pub blobstore_selector: LabelSelector,
    pub credential: CredentialConfig,
    pub watch: WatchSettings,
}

impl ControllerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let selector = |key: &str, default: &str| -> Result<LabelSelector, ControllerError> {
            lookup(key)
                .as_deref()
                .unwrap_or(default)
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("{key}: {e}")))
        };

        let reconnect_enabled = match lookup("WATCH_RECONNECT").as_deref() {
            None => false,
            Some(value) => parse_bool(value).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("WATCH_RECONNECT: expected true or false, got '{value}'"))
            })?,
        };
        let max_attempts = match lookup("WATCH_MAX_RECONNECTS") {
            None => DEFAULT_MAX_RECONNECTS,
            Some(value) => value.trim().parse().map_err(|_| {
                ControllerError::InvalidConfig(format!("WATCH_MAX_RECONNECTS: expected a number, got '{value}'"))
            })?,
        };

        Ok(Self {
            namespace_file: lookup("NAMESPACE_FILE")
                .map_or_else(|| PathBuf::from(SERVICE_ACCOUNT_NAMESPACE_FILE), PathBuf::from),
            namespace_fallback: lookup(NAMESPACE_ENV),
            repository_selector: selector("REPOSITORY_SELECTOR", DEFAULT_REPOSITORY_SELECTOR)?,
            blobstore_selector: selector("BLOBSTORE_SELECTOR", DEFAULT_BLOBSTORE_SELECTOR)?,
            credential: CredentialConfig {
                password_fallback: lookup(PASSWORD_ENV),
                ..CredentialConfig::default()
            },
            watch: WatchSettings {
                reconnect: if reconnect_enabled {
                    ReconnectPolicy::Backoff { max_attempts }
                } else {
                    ReconnectPolicy::Never
                },
                ..WatchSettings::default()
            },
        })
    }
}

/// Nexus REST endpoint and the credentials used to call it
#[derive(Clone)]
pub struct NexusConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for NexusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NexusConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl NexusConfig {
    /// Load from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            url: lookup("NEXUS_URL").unwrap_or_else(|| DEFAULT_NEXUS_URL.to_string()),
            username: lookup("NEXUS_ADMIN_USER").unwrap_or_else(|| ADMIN_ACCOUNT.to_string()),
            password: lookup("NEXUS_ADMIN_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
