//! Backend registry and factory table.
//!
//! The registry maps a reference discriminant to its backend implementation.
//! It is built once at startup, either by registering backends directly or
//! from configuration via named factories; lookups of unknown discriminants
//! fail fast with [`SecretError::UnknownBackend`].

use std::collections::HashMap;
use std::sync::Arc;

use super::{EnvBackend, MemoryBackend, SecretBackend};
use crate::config::{BackendConfig, ServiceConfig};
use crate::error::{SecretError, SigilkeepError};
use crate::model::BackendId;

/// Constructor for a backend kind.
pub type BackendFactory = Arc<
    dyn Fn(&BackendId, &BackendConfig) -> Result<Arc<dyn SecretBackend>, SigilkeepError>
        + Send
        + Sync,
>;

/// Registry of secret backends keyed by discriminant.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use sigilkeep_core::backend::{BackendRegistry, MemoryBackend};
/// use sigilkeep_core::BackendId;
///
/// let mut registry = BackendRegistry::new();
/// registry.register(Arc::new(MemoryBackend::new("vault")));
///
/// assert!(registry.get(&BackendId::new("vault")).is_ok());
/// assert!(registry.get(&BackendId::new("aws")).is_err());
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn SecretBackend>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for the backend kinds shipped with the engine.
    ///
    /// - `memory`: [`MemoryBackend`]
    /// - `env`: [`EnvBackend`], honoring the `prefix` option
    pub fn default_factories() -> HashMap<String, BackendFactory> {
        let mut factories: HashMap<String, BackendFactory> = HashMap::new();

        factories.insert(
            "memory".to_string(),
            Arc::new(
                |id: &BackendId, _config: &BackendConfig| -> Result<Arc<dyn SecretBackend>, SigilkeepError> {
                    Ok(Arc::new(MemoryBackend::new(id.clone())))
                },
            ),
        );

        factories.insert(
            "env".to_string(),
            Arc::new(
                |id: &BackendId, config: &BackendConfig| -> Result<Arc<dyn SecretBackend>, SigilkeepError> {
                    let backend = match config.options.get("prefix") {
                        Some(prefix) => EnvBackend::with_prefix(id.clone(), prefix.clone()),
                        None => EnvBackend::new(id.clone()),
                    };
                    Ok(Arc::new(backend))
                },
            ),
        );

        factories
    }

    /// Build a registry from configuration.
    ///
    /// Every configured backend's `kind` must name a factory; an unknown kind
    /// is a missing integration and fails with `BackendUnsupported`.
    pub fn from_config(
        config: &ServiceConfig,
        factories: &HashMap<String, BackendFactory>,
    ) -> Result<Self, SigilkeepError> {
        let mut registry = Self::new();

        for (id, backend_config) in &config.backends {
            let id = BackendId::new(id.as_str());
            let factory = factories.get(&backend_config.kind).ok_or_else(|| {
                SecretError::unsupported(
                    id.as_str(),
                    format!("no integration for backend kind '{}'", backend_config.kind),
                )
            })?;

            let backend = factory(&id, backend_config)?;
            if backend.id() != &id {
                return Err(SigilkeepError::config(format!(
                    "factory for '{}' produced backend '{}'",
                    id,
                    backend.id()
                )));
            }
            registry.register(backend);
        }

        Ok(registry)
    }

    /// Register a backend under its own id.
    ///
    /// If a backend with the same id already exists, it will be replaced.
    pub fn register(&mut self, backend: Arc<dyn SecretBackend>) {
        let id = backend.id().clone();
        tracing::info!(backend = %id, "registering secret backend");
        self.backends.insert(id, backend);
    }

    /// Look up a backend by discriminant.
    pub fn get(&self, id: &BackendId) -> Result<Arc<dyn SecretBackend>, SecretError> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| SecretError::UnknownBackend {
                backend: id.to_string(),
            })
    }

    /// Check if a backend is registered.
    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains_key(id)
    }

    /// List all registered backend ids, sorted.
    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_new() {
        let registry = BackendRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::new();
        let result = registry.get(&BackendId::new("gcp"));
        assert!(matches!(result, Err(SecretError::UnknownBackend { .. })));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MemoryBackend::new("vault")));
        registry.register(Arc::new(MemoryBackend::new("VAULT")));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&BackendId::new("vault")));
    }

    #[test]
    fn test_from_config_uses_factories() {
        let mut config = ServiceConfig::default();
        config
            .backends
            .insert("vault".to_string(), BackendConfig::default());
        let mut env = BackendConfig {
            kind: "env".to_string(),
            ..BackendConfig::default()
        };
        env.options.insert("prefix".to_string(), "APP".to_string());
        config.backends.insert("env".to_string(), env);

        let registry =
            BackendRegistry::from_config(&config, &BackendRegistry::default_factories()).unwrap();
        assert_eq!(
            registry.ids(),
            vec![BackendId::new("env"), BackendId::new("vault")]
        );
    }

    #[test]
    fn test_from_config_unknown_kind_fails_fast() {
        let mut config = ServiceConfig::default();
        config.backends.insert(
            "aws".to_string(),
            BackendConfig {
                kind: "aws-sdk".to_string(),
                ..BackendConfig::default()
            },
        );

        let result = BackendRegistry::from_config(&config, &BackendRegistry::default_factories());
        assert!(matches!(
            result,
            Err(SigilkeepError::Secret(SecretError::BackendUnsupported { .. }))
        ));
    }
}
