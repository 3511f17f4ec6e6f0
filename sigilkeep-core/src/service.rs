//! Engine lifecycle.
//!
//! [`SecretService`] owns the cache, event bus, dispatcher, lease manager,
//! rotation watchers, and background tasks of one engine instance. It is
//! constructed explicitly with [`SecretService::start`] and torn down with
//! [`SecretService::shutdown`]; nothing is global.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendRegistry;
use crate::cache::ResolutionCache;
use crate::config::ServiceConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SecretError, SigilkeepError};
use crate::events::{EventBus, SecretEvent};
use crate::lease::{Lease, LeaseManager};
use crate::model::BackendId;
use crate::review::ReviewRegistry;
use crate::watcher::RotationWatcher;

/// A running engine instance.
pub struct SecretService {
    config: ServiceConfig,
    dispatcher: Dispatcher,
    cache: ResolutionCache,
    events: EventBus,
    leases: LeaseManager,
    reviews: ReviewRegistry,
    watchers: Vec<RotationWatcher>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SecretService {
    /// Wire up the engine and start its background tasks.
    ///
    /// Every backend named in `config` must be present in `registry`.
    /// Must be called within a tokio runtime.
    pub fn start(
        config: ServiceConfig,
        registry: BackendRegistry,
    ) -> std::result::Result<Self, SigilkeepError> {
        config.validate()?;

        let cache = ResolutionCache::new();
        let events = EventBus::new(config.event_capacity);
        let leases = LeaseManager::new(registry.clone(), cache.clone(), events.clone());

        for (id, backend_config) in &config.backends {
            let id = BackendId::new(id.as_str());
            if !registry.contains(&id) {
                return Err(SigilkeepError::config(format!(
                    "backend '{}' is configured but not registered",
                    id
                )));
            }
            cache.set_policy(id.clone(), backend_config.cache_policy());
            leases.set_policy(id, backend_config.leases.renewal_policy());
        }

        let mut watchers = Vec::new();
        for (id, backend_config) in &config.backends {
            if !backend_config.rotation.enabled {
                continue;
            }
            let backend = registry.get(&BackendId::new(id.as_str()))?;
            let watcher = RotationWatcher::new(
                backend,
                backend_config.rotation.strategy(),
                cache.clone(),
                events.clone(),
            );
            watcher.start()?;
            watchers.push(watcher);
        }

        let cancel = CancellationToken::new();
        let reviews = ReviewRegistry::from_schedules(config.reviews.iter().cloned());
        let mut tasks = vec![cache.spawn_sweeper(
            Duration::from_secs(config.cache_sweep_interval_seconds),
            cancel.child_token(),
        )];
        if let Some(seconds) = config.review_check_interval_seconds {
            tasks.push(reviews.spawn_checker(
                events.clone(),
                Duration::from_secs(seconds),
                cancel.child_token(),
            ));
        }

        let dispatcher = Dispatcher::new(registry, cache.clone(), events.clone());

        tracing::info!(
            backends = config.backends.len(),
            watchers = watchers.len(),
            reviews = reviews.len(),
            "secret service started"
        );

        Ok(Self {
            config,
            dispatcher,
            cache,
            events,
            leases,
            reviews,
            watchers,
            cancel,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn reviews(&self) -> &ReviewRegistry {
        &self.reviews
    }

    pub fn watchers(&self) -> &[RotationWatcher] {
        &self.watchers
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Request a dynamic credential.
    ///
    /// Backends configured with lease management disabled refuse the request.
    pub async fn request_lease(&self, backend: &BackendId, role: &str) -> Result<Lease> {
        let configured = self
            .config
            .backends
            .iter()
            .find(|(id, _)| BackendId::new(id.as_str()) == *backend);
        if let Some((_, backend_config)) = configured {
            if !backend_config.leases.enabled {
                return Err(SecretError::unsupported(
                    backend.as_str(),
                    "lease management is disabled",
                ));
            }
        }
        self.leases.request_dynamic(backend, role).await
    }

    /// Run an event handler until the service shuts down.
    pub fn listen<F, Fut, E>(&self, name: impl Into<String>, handler: F)
    where
        F: FnMut(SecretEvent) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send,
        E: std::fmt::Display + Send,
    {
        let handle = self
            .events
            .spawn_listener(name, handler, self.cancel.child_token());
        self.tasks.lock().push(handle);
    }

    /// Stop every background task, release leases, and clear the cache.
    ///
    /// Lease revocation is bounded by the configured shutdown timeout.
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down secret service");

        for watcher in &self.watchers {
            watcher.stop().await;
        }

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        let released = self.leases.shutdown(self.config.shutdown_timeout()).await;
        self.cache.invalidate_all();

        tracing::info!(released, "secret service stopped");
    }
}

impl std::fmt::Debug for SecretService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretService")
            .field("backends", &self.dispatcher.registry().ids())
            .field("watchers", &self.watchers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Shared handle to a running service.
pub type SharedService = Arc<SecretService>;
