//! Secret backend capability contract.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`SecretBackend`] - The capability contract each backend integration implements
//! - [`MemoryBackend`] - In-memory, versioned backend for tests and development
//! - [`EnvBackend`] - Read-only backend over environment variables
//! - [`BackendRegistry`] - Discriminant to backend table, built once at startup
//!
//! Integrations normalize their native errors into [`SecretError`] before
//! returning; the engine never sees SDK-specific failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use sigilkeep_core::backend::{MemoryBackend, Secret, SecretBackend};
//!
//! let backend = MemoryBackend::new("vault");
//! backend.store("db/password", &Secret::new("hunter2")).await?;
//!
//! let value = backend.fetch("db/password", None).await?;
//! assert_eq!(value.expose(), "hunter2");
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecretError};
use crate::model::BackendId;

mod env;
mod memory;
mod registry;

pub use env::EnvBackend;
pub use memory::MemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose) and is
/// wiped from memory when dropped. Debug and Display implementations show
/// `[REDACTED]` instead of the value.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// Result of a backend health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Notification pushed by a backend whose integration supports change
/// subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub secret_name: String,
    pub new_version: Option<String>,
}

/// A dynamic credential as issued or renewed by a backend.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    /// Backend-assigned lease identifier.
    pub lease_id: String,

    /// Credential fields (e.g., `username`, `password`).
    pub data: BTreeMap<String, Secret>,

    /// Lifetime granted by the backend.
    pub ttl_seconds: u64,

    /// Whether the backend allows renewing this lease.
    pub renewable: bool,
}

/// Capability contract consumed from every secret backend.
///
/// Only [`fetch`](SecretBackend::fetch), [`store`](SecretBackend::store),
/// [`list`](SecretBackend::list) and [`health_check`](SecretBackend::health_check)
/// are mandatory. Rotation detection and dynamic credentials are optional
/// capabilities whose defaults report [`SecretError::BackendUnsupported`].
#[async_trait]
pub trait SecretBackend: Send + Sync + std::fmt::Debug {
    /// The discriminant this backend is registered under.
    fn id(&self) -> &BackendId;

    /// Fetch a secret value, `version = None` meaning latest.
    async fn fetch(&self, name: &str, version: Option<&str>) -> Result<Secret>;

    /// Store a new value for a secret.
    async fn store(&self, name: &str, value: &Secret) -> Result<()>;

    /// List secret names known to the backend.
    async fn list(&self) -> Result<Vec<String>>;

    /// Check connectivity and credentials.
    async fn health_check(&self) -> HealthStatus;

    /// Return an opaque marker (version id, update timestamp) that changes
    /// whenever the secret is rotated. Used by poll watchers.
    async fn version_marker(&self, name: &str) -> Result<String> {
        let _ = name;
        Err(SecretError::unsupported(
            self.id().as_str(),
            "version markers",
        ))
    }

    /// Open a push channel of change notices. Used by subscribe watchers.
    ///
    /// Returns `None` when the integration has no push notifications.
    fn subscribe_changes(&self) -> Option<mpsc::Receiver<ChangeNotice>> {
        None
    }

    /// Issue a dynamic credential for a role.
    async fn issue_lease(&self, role: &str) -> Result<LeaseGrant> {
        let _ = role;
        Err(SecretError::unsupported(
            self.id().as_str(),
            "dynamic credentials",
        ))
    }

    /// Renew a previously issued lease.
    async fn renew_lease(&self, lease_id: &str) -> Result<LeaseGrant> {
        let _ = lease_id;
        Err(SecretError::unsupported(
            self.id().as_str(),
            "lease renewal",
        ))
    }

    /// Revoke a previously issued lease.
    async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        let _ = lease_id;
        Err(SecretError::unsupported(
            self.id().as_str(),
            "lease revocation",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_display_redacted() {
        let secret = Secret::new("super-secret");
        let display = format!("{}", secret);
        assert!(!display.contains("super-secret"));
        assert!(display.contains("REDACTED"));
    }

    #[test]
    fn test_secret_into_inner() {
        let secret = Secret::new("value");
        assert_eq!(secret.clone().into_inner(), "value");
        assert_eq!(secret.expose(), "value");
    }

    #[derive(Debug)]
    struct MinimalBackend {
        id: BackendId,
    }

    #[async_trait]
    impl SecretBackend for MinimalBackend {
        fn id(&self) -> &BackendId {
            &self.id
        }

        async fn fetch(&self, name: &str, _version: Option<&str>) -> Result<Secret> {
            Err(SecretError::not_found(self.id.as_str(), name))
        }

        async fn store(&self, _name: &str, _value: &Secret) -> Result<()> {
            Ok(())
        }

        async fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::healthy()
        }
    }

    #[tokio::test]
    async fn test_optional_capabilities_default_to_unsupported() {
        let backend = MinimalBackend {
            id: BackendId::new("minimal"),
        };

        assert!(matches!(
            backend.version_marker("x").await,
            Err(SecretError::BackendUnsupported { .. })
        ));
        assert!(matches!(
            backend.issue_lease("role").await,
            Err(SecretError::BackendUnsupported { .. })
        ));
        assert!(backend.subscribe_changes().is_none());
    }
}
