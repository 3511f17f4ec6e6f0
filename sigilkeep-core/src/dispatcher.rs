//! Reference dispatch.
//!
//! This module provides:
//! - [`SecretResolver`] - Trait for resolving `${backend:name[#version]}` references
//! - [`Dispatcher`] - Routes references to their backend through the resolution cache
//! - Template and JSON tree resolution for configuration values

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinSet;

use crate::backend::{BackendRegistry, HealthStatus, Secret};
use crate::cache::ResolutionCache;
use crate::error::{Result, SecretError};
use crate::events::{EventBus, SecretEvent};
use crate::model::{self, BackendId, SecretRef};

/// Trait for resolving secret references.
///
/// # Example
///
/// ```rust,ignore
/// use sigilkeep_core::SecretResolver;
///
/// async fn database_password(resolver: &impl SecretResolver) -> String {
///     let value = resolver.resolve("${vault:db/password}").await.unwrap();
///     value.expose().to_string()
/// }
/// ```
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve a reference string to its value.
    async fn resolve(&self, reference: &str) -> Result<Secret>;

    /// Resolve an already parsed reference.
    async fn resolve_ref(&self, secret_ref: &SecretRef) -> Result<Secret>;

    /// Resolve several references, keeping each outcome.
    async fn resolve_batch(&self, references: &[String]) -> Vec<(String, Result<Secret>)> {
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            let result = self.resolve(reference).await;
            results.push((reference.clone(), result));
        }
        results
    }
}

/// Routes reads through the resolution cache and writes to the backend.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: BackendRegistry,
    cache: ResolutionCache,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(registry: BackendRegistry, cache: ResolutionCache, events: EventBus) -> Self {
        Self {
            registry,
            cache,
            events,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Write a new value for the latest version of a secret.
    ///
    /// The write goes straight to the backend; cached entries of the secret
    /// are invalidated afterwards so the next read observes the new value.
    pub async fn set(&self, reference: &str, value: Secret) -> Result<()> {
        let secret_ref = SecretRef::parse(reference)?;
        self.set_ref(&secret_ref, value).await
    }

    pub async fn set_ref(&self, secret_ref: &SecretRef, value: Secret) -> Result<()> {
        if let Some(version) = &secret_ref.version {
            return Err(SecretError::InvalidReference {
                reference: secret_ref.to_string(),
                message: format!("cannot write to pinned version '{}'", version),
            });
        }

        let backend = self.registry.get(&secret_ref.backend)?;
        let result = backend.store(&secret_ref.name, &value).await;
        self.report_auth_failure(secret_ref, &result);
        result?;

        self.cache.invalidate(&secret_ref.backend, &secret_ref.name);
        tracing::info!(reference = %secret_ref, "stored secret");
        Ok(())
    }

    /// Replace every reference embedded in `text` with its value.
    pub async fn resolve_template(&self, text: &str) -> Result<String> {
        let spans = model::find_references(text);
        if spans.is_empty() {
            return Ok(text.to_string());
        }

        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for span in spans {
            output.push_str(&text[last..span.start]);
            let value = self.resolve(&text[span.clone()]).await?;
            output.push_str(value.expose());
            last = span.end;
        }
        output.push_str(&text[last..]);
        Ok(output)
    }

    /// Resolve every reference found in the string leaves of a JSON tree.
    ///
    /// Distinct references are resolved concurrently; the first failure is
    /// returned.
    pub async fn resolve_tree(&self, mut tree: Value) -> Result<Value> {
        let mut references = Vec::new();
        collect_references(&tree, &mut references);
        references.sort();
        references.dedup();

        let mut tasks = JoinSet::new();
        for reference in references {
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let value = dispatcher.resolve(&reference).await;
                (reference, value)
            });
        }

        let mut resolved = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (reference, value) = joined.map_err(|e| {
                SecretError::unavailable("dispatcher", format!("resolution task failed: {}", e))
            })?;
            resolved.insert(reference, value?);
        }

        substitute(&mut tree, &resolved);
        Ok(tree)
    }

    /// Names stored in a backend.
    pub async fn list(&self, backend: &BackendId) -> Result<Vec<String>> {
        self.registry.get(backend)?.list().await
    }

    /// Health of every registered backend.
    pub async fn health(&self) -> BTreeMap<BackendId, HealthStatus> {
        let mut report = BTreeMap::new();
        for id in self.registry.ids() {
            let status = match self.registry.get(&id) {
                Ok(backend) => backend.health_check().await,
                Err(e) => HealthStatus::unhealthy(e.to_string()),
            };
            report.insert(id, status);
        }
        report
    }

    fn report_auth_failure<T>(&self, secret_ref: &SecretRef, result: &Result<T>) {
        if let Err(e) = result {
            if e.is_auth_failure() {
                tracing::warn!(reference = %secret_ref, error = %e, "backend rejected credentials");
                self.events.publish(SecretEvent::AuthFailed {
                    backend: secret_ref.backend.to_string(),
                    secret_name: secret_ref.name.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl SecretResolver for Dispatcher {
    async fn resolve(&self, reference: &str) -> Result<Secret> {
        let secret_ref = SecretRef::parse(reference)?;
        self.resolve_ref(&secret_ref).await
    }

    async fn resolve_ref(&self, secret_ref: &SecretRef) -> Result<Secret> {
        let backend = self.registry.get(&secret_ref.backend)?;
        let key = secret_ref.cache_key();

        let name = secret_ref.name.clone();
        let version = secret_ref.version.clone();
        let result = self
            .cache
            .get(&key, move || async move {
                backend.fetch(&name, version.as_deref()).await
            })
            .await;

        self.report_auth_failure(secret_ref, &result);
        result
    }
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for span in model::find_references(s) {
                out.push(s[span].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}

fn substitute(value: &mut Value, resolved: &HashMap<String, Secret>) {
    match value {
        Value::String(s) => {
            let spans = model::find_references(s);
            if spans.is_empty() {
                return;
            }
            let mut output = String::with_capacity(s.len());
            let mut last = 0;
            for span in spans {
                output.push_str(&s[last..span.start]);
                match resolved.get(&s[span.clone()]) {
                    Some(secret) => output.push_str(secret.expose()),
                    None => output.push_str(&s[span.clone()]),
                }
                last = span.end;
            }
            output.push_str(&s[last..]);
            *s = output;
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute(item, resolved)),
        Value::Object(map) => map.values_mut().for_each(|item| substitute(item, resolved)),
        _ => {}
    }
}
