//! Environment variable secret backend.
//!
//! Secrets are read from `{PREFIX}_{NAME}` where the name is uppercased and
//! every character outside `[A-Z0-9]` becomes `_`:
//!
//! ```bash
//! export SIGILKEEP_SECRET_DB_PASSWORD="hunter2"   # ${env:db/password}
//! ```
//!
//! Intended for development. The backend is read-only and unversioned.

use async_trait::async_trait;
use std::env;

use super::{HealthStatus, Secret, SecretBackend};
use crate::error::{Result, SecretError};
use crate::model::BackendId;

/// Default environment variable prefix.
pub const DEFAULT_PREFIX: &str = "SIGILKEEP_SECRET";

/// Read-only backend over process environment variables.
#[derive(Debug, Clone)]
pub struct EnvBackend {
    id: BackendId,
    prefix: String,
}

impl EnvBackend {
    /// Create an env backend with the default prefix.
    pub fn new(id: impl Into<BackendId>) -> Self {
        Self::with_prefix(id, DEFAULT_PREFIX)
    }

    /// Create an env backend with a custom prefix.
    pub fn with_prefix(id: impl Into<BackendId>, prefix: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prefix: prefix.into().trim_end_matches('_').to_uppercase(),
        }
    }

    /// Environment variable consulted for a secret name.
    pub fn var_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.prefix, normalized)
    }
}

#[async_trait]
impl SecretBackend for EnvBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn fetch(&self, name: &str, version: Option<&str>) -> Result<Secret> {
        if version.is_some() {
            return Err(SecretError::unsupported(
                self.id.as_str(),
                "pinned versions",
            ));
        }

        let var = self.var_name(name);
        match env::var(&var) {
            Ok(value) => Ok(Secret::new(value)),
            Err(_) => {
                tracing::trace!(backend = %self.id, var = %var, "environment variable not set");
                Err(SecretError::not_found(self.id.as_str(), name))
            }
        }
    }

    async fn store(&self, name: &str, _value: &Secret) -> Result<()> {
        Err(SecretError::unsupported(
            self.id.as_str(),
            format!("cannot store '{}', environment backend is read-only", name),
        ))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let prefix = format!("{}_", self.prefix);
        let mut names: Vec<String> = env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(|n| n.to_lowercase()))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }
}
