//! # Sigilkeep Core
//!
//! Resolution engine for `${backend:name[#version]}` secret references.
//!
//! This crate provides:
//! - A stale-while-revalidate resolution cache with single-flight fetches
//! - Rotation watchers that invalidate cached secrets changed upstream
//! - A lease manager for dynamic, renewable credentials
//! - A typed event bus for rotation, expiry, and review notifications
//! - The capability contract backends implement, plus memory and env backends
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sigilkeep_core::{BackendRegistry, MemoryBackend, SecretResolver, SecretService, ServiceConfig};
//!
//! async fn run() -> Result<(), sigilkeep_core::SigilkeepError> {
//!     let mut registry = BackendRegistry::new();
//!     registry.register(Arc::new(MemoryBackend::new("vault")));
//!
//!     let service = SecretService::start(ServiceConfig::default(), registry)?;
//!     let password = service.dispatcher().resolve("${vault:db/password}").await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lease;
pub mod model;
pub mod review;
pub mod service;
pub mod watcher;

// Re-export commonly used types at crate root
pub use model::{
    BackendId,
    CacheKey,
    SecretRef,
};

pub use backend::{
    BackendRegistry,
    EnvBackend,
    HealthStatus,
    MemoryBackend,
    Secret,
    SecretBackend,
};

pub use cache::{
    CachePolicy,
    ResolutionCache,
};

pub use config::{
    BackendConfig,
    LeaseConfig,
    RotationConfig,
    ServiceConfig,
};

pub use dispatcher::{
    Dispatcher,
    SecretResolver,
};

pub use error::{
    SecretError,
    SigilkeepError,
};

pub use events::{
    EventBus,
    SecretEvent,
};

pub use lease::{
    Lease,
    LeaseManager,
    LeaseState,
    RenewalPolicy,
};

pub use review::{
    Classification,
    ReviewRegistry,
    ReviewSchedule,
};

pub use service::{
    SecretService,
    SharedService,
};

pub use watcher::{
    RotationWatcher,
    WatchStrategy,
    WatcherState,
};
