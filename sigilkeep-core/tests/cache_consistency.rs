//! Integration tests for the resolution cache.
//!
//! These tests verify that the ResolutionCache:
//! - Collapses concurrent misses into one backend fetch
//! - Serves fresh values without touching the backend
//! - Serves stale values while revalidating, and records failures
//! - Never caches a fetch overtaken by an invalidation

mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use common::{ScriptedBackend, wait_until};
use sigilkeep_core::backend::SecretBackend;
use sigilkeep_core::error::Result;
use sigilkeep_core::{BackendId, CacheKey, CachePolicy, ResolutionCache, Secret, SecretError};

type FetchFuture = Pin<Box<dyn Future<Output = Result<Secret>> + Send>>;

/// Supplier that fetches `name` from the scripted backend.
fn fetch_from(backend: &Arc<ScriptedBackend>, name: &str) -> impl FnOnce() -> FetchFuture + Send + use<> {
    let backend = backend.clone();
    let name = name.to_string();
    move || -> FetchFuture { Box::pin(async move { backend.fetch(&name, None).await }) }
}

fn policy(ttl: u64) -> CachePolicy {
    CachePolicy::with_ttl(Duration::from_secs(ttl))
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_fetch() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");
    backend.set_fetch_delay(Duration::from_millis(50));

    let cache = ResolutionCache::new();
    let key = CacheKey::latest("vault", "db");

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let key = key.clone();
        let fetch = fetch_from(&backend, "db");
        tasks.spawn(async move { cache.get(&key, fetch).await });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap().expose(), "v1");
    }
    assert_eq!(backend.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failure_is_shared_and_not_cached() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set_fetch_delay(Duration::from_millis(50));
    backend.fail_fetch(Some(SecretError::permission_denied("vault", "db")));

    let cache = ResolutionCache::new();
    let key = CacheKey::latest("vault", "db");

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let key = key.clone();
        let fetch = fetch_from(&backend, "db");
        tasks.spawn(async move { cache.get(&key, fetch).await });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(
            result.unwrap().unwrap_err(),
            SecretError::permission_denied("vault", "db")
        );
    }
    assert_eq!(backend.fetch_calls(), 1);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_refetches() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");

    let cache = ResolutionCache::with_policy(policy(300).without_stale());
    let key = CacheKey::latest("vault", "db");

    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v1");

    tokio::time::advance(Duration::from_secs(250)).await;
    backend.set("db", "v2");
    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v1");
    assert_eq!(backend.fetch_calls(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v2");
    assert_eq!(backend.fetch_calls(), 2);

    tokio::time::advance(Duration::from_secs(10)).await;
    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v2");
    assert_eq!(backend.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_served_while_revalidating() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");

    let cache = ResolutionCache::with_policy(policy(300));
    let key = CacheKey::latest("vault", "db");
    cache.get(&key, fetch_from(&backend, "db")).await.unwrap();

    backend.set("db", "v2");
    tokio::time::advance(Duration::from_secs(310)).await;

    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v1");

    let observer = cache.clone();
    let watched_key = key.clone();
    let fetched_at = cache.entry_info(&key).unwrap().fetched_at;
    assert!(
        wait_until(
            move || observer
                .entry_info(&watched_key)
                .is_some_and(|info| info.fetched_at > fetched_at),
            100
        )
        .await
    );

    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v2");
    assert_eq!(backend.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_revalidation_keeps_stale_value() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");

    let cache = ResolutionCache::with_policy(policy(300));
    let key = CacheKey::latest("vault", "db");
    let start = tokio::time::Instant::now();
    cache.get(&key, fetch_from(&backend, "db")).await.unwrap();

    let info = cache.entry_info(&key).unwrap();
    assert_eq!(info.fresh_until - start, Duration::from_secs(300));
    assert_eq!(info.stale_until.unwrap() - start, Duration::from_secs(600));

    tokio::time::advance(Duration::from_secs(350)).await;
    backend.fail_fetch(Some(SecretError::unavailable("vault", "sealed")));

    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v1");

    let observer = cache.clone();
    let watched_key = key.clone();
    assert!(
        wait_until(
            move || observer
                .entry_info(&watched_key)
                .is_some_and(|info| info.last_error.is_some()),
            100
        )
        .await
    );

    let info = cache.entry_info(&key).unwrap();
    assert!(matches!(info.last_error, Some(SecretError::Unavailable { .. })));
    assert_eq!(info.stale_until.unwrap() - start, Duration::from_secs(900));
}

#[tokio::test(start_paused = true)]
async fn test_error_propagates_after_stale_window() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");

    let cache = ResolutionCache::with_policy(policy(300));
    let key = CacheKey::latest("vault", "db");
    cache.get(&key, fetch_from(&backend, "db")).await.unwrap();

    tokio::time::advance(Duration::from_secs(601)).await;
    backend.fail_fetch(Some(SecretError::unavailable("vault", "timeout")));

    let result = cache.get(&key, fetch_from(&backend, "db")).await;
    assert_eq!(
        result.unwrap_err(),
        SecretError::unavailable("vault", "timeout")
    );
    assert!(cache.entry_info(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_revalidation_evicts() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");

    let cache = ResolutionCache::with_policy(policy(300));
    let key = CacheKey::latest("vault", "db");
    cache.get(&key, fetch_from(&backend, "db")).await.unwrap();

    tokio::time::advance(Duration::from_secs(350)).await;
    backend.fail_fetch(Some(SecretError::not_found("vault", "db")));

    let value = cache.get(&key, fetch_from(&backend, "db")).await.unwrap();
    assert_eq!(value.expose(), "v1");

    let observer = cache.clone();
    let watched_key = key.clone();
    assert!(wait_until(move || observer.entry_info(&watched_key).is_none(), 100).await);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_overtaken_by_invalidation_is_not_cached() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");
    backend.set_fetch_delay(Duration::from_millis(100));

    let cache = ResolutionCache::new();
    let key = CacheKey::latest("vault", "db");

    let pending = {
        let cache = cache.clone();
        let key = key.clone();
        let fetch = fetch_from(&backend, "db");
        tokio::spawn(async move { cache.get(&key, fetch).await })
    };

    let observer = backend.clone();
    assert!(wait_until(move || observer.fetch_calls() == 1, 100).await);

    cache.invalidate(&BackendId::new("vault"), "db");

    assert_eq!(pending.await.unwrap().unwrap().expose(), "v1");
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_matches_every_version_of_one_secret() {
    let backend = Arc::new(ScriptedBackend::new("vault"));
    backend.set("db", "v1");
    backend.set("api", "k1");

    let cache = ResolutionCache::new();
    let vault = BackendId::new("vault");
    let pinned = CacheKey::new(vault.clone(), "db", Some("1".to_string()));

    cache.get(&pinned, fetch_from(&backend, "db")).await.unwrap();
    cache
        .get(&CacheKey::latest("vault", "db"), fetch_from(&backend, "db"))
        .await
        .unwrap();
    cache
        .get(&CacheKey::latest("vault", "api"), fetch_from(&backend, "api"))
        .await
        .unwrap();
    assert_eq!(cache.len(), 3);

    assert_eq!(cache.invalidate(&vault, "db"), 2);
    assert_eq!(cache.cached_names(&vault), vec!["api"]);

    assert_eq!(cache.invalidate(&vault, "db"), 0);
    assert_eq!(cache.invalidate(&vault, "missing"), 0);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_backend_policy() {
    let backend = Arc::new(ScriptedBackend::new("aws"));
    backend.set("token", "t1");

    let cache = ResolutionCache::with_policy(policy(300));
    cache.set_policy(BackendId::new("aws"), policy(10).without_stale());
    let key = CacheKey::latest("aws", "token");

    cache.get(&key, fetch_from(&backend, "token")).await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    cache.get(&key, fetch_from(&backend, "token")).await.unwrap();

    assert_eq!(backend.fetch_calls(), 2);
}
