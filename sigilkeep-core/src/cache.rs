//! Resolution cache with stale-while-revalidate and single-flight fetches.
//!
//! # Cache Strategy
//!
//! Entries are keyed by `(backend, name, version-or-latest)` and move through
//! three windows:
//!
//! ```text
//! fetched_at ──ttl──▶ fresh_until ──stale window──▶ stale_until ──▶ evicted
//!     served directly      served + background revalidation
//! ```
//!
//! - **Fresh**: returned without touching the backend.
//! - **Stale**: returned immediately while one background revalidation runs.
//!   A failed revalidation extends `stale_until` by one TTL (bounded by
//!   `max_stale` from the last successful fetch) and records the error.
//! - **Expired / missing**: fetched synchronously. Concurrent callers for the
//!   same key attach to the one in-flight fetch and share its result.
//!
//! Only metadata is guarded by the state lock; no lock is held across a
//! backend round-trip.
//!
//! A fetch or revalidation that is overtaken by an invalidation still answers
//! its waiting callers but never installs its result.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Secret;
use crate::error::{Result, SecretError};
use crate::model::{BackendId, CacheKey};

/// Default freshness window (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default hard cap on staleness (1 hour).
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(3600);

/// Freshness and staleness bounds for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// How long a fetched value is fresh.
    pub ttl: Duration,

    /// How long past freshness a value may be served while revalidating.
    /// Zero disables stale serving.
    pub stale_window: Duration,

    /// Upper bound on `stale_until - fetched_at` after failed revalidations.
    pub max_stale: Duration,
}

impl CachePolicy {
    /// Policy with the given TTL and a stale window of the same length.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_window: ttl,
            max_stale: DEFAULT_MAX_STALE.max(ttl * 2),
        }
    }

    /// Same policy without stale serving.
    pub fn without_stale(mut self) -> Self {
        self.stale_window = Duration::ZERO;
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Expired,
}

struct CacheEntry {
    value: Secret,
    fetched_at: Instant,
    fresh_until: Instant,
    stale_until: Option<Instant>,
    last_error: Option<SecretError>,
}

impl CacheEntry {
    fn new(value: Secret, now: Instant, policy: &CachePolicy) -> Self {
        let fresh_until = now + policy.ttl;
        let stale_until =
            (!policy.stale_window.is_zero()).then(|| fresh_until + policy.stale_window);
        Self {
            value,
            fetched_at: now,
            fresh_until,
            stale_until,
            last_error: None,
        }
    }

    fn freshness(&self, now: Instant) -> Freshness {
        if now <= self.fresh_until {
            Freshness::Fresh
        } else if self.stale_until.is_some_and(|until| now <= until) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    fn extend_staleness(&mut self, policy: &CachePolicy) {
        if let Some(until) = self.stale_until {
            let cap = self.fetched_at + policy.max_stale;
            self.stale_until = Some(until.max((until + policy.ttl).min(cap)));
        }
    }
}

/// Read-only view of a cache entry, without its value.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub fetched_at: Instant,
    pub fresh_until: Instant,
    pub stale_until: Option<Instant>,
    pub last_error: Option<SecretError>,
}

struct Flight {
    result: OnceCell<Result<Secret>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    inflight: HashMap<CacheKey, Arc<Flight>>,
    revalidating: HashMap<CacheKey, u64>,
    next_ticket: u64,
}

struct Inner {
    state: Mutex<CacheState>,
    policies: RwLock<HashMap<BackendId, CachePolicy>>,
    default_policy: CachePolicy,
}

/// TTL-bounded, stale-while-revalidate secret cache.
///
/// Cloning is cheap; clones share the same entries.
///
/// # Example
///
/// ```rust,ignore
/// use sigilkeep_core::{CacheKey, ResolutionCache, backend::Secret};
///
/// let cache = ResolutionCache::new();
/// let key = CacheKey::latest("vault", "db/password");
///
/// let value = cache
///     .get(&key, || async { Ok(Secret::new("hunter2")) })
///     .await?;
/// ```
#[derive(Clone)]
pub struct ResolutionCache {
    inner: Arc<Inner>,
}

impl ResolutionCache {
    /// Create a cache with the default policy.
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::default())
    }

    /// Create a cache whose backends default to `policy`.
    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState::default()),
                policies: RwLock::new(HashMap::new()),
                default_policy: policy,
            }),
        }
    }

    /// Override the policy for one backend.
    pub fn set_policy(&self, backend: BackendId, policy: CachePolicy) {
        self.inner.policies.write().insert(backend, policy);
    }

    /// Policy applied to a backend's entries.
    pub fn policy_for(&self, backend: &BackendId) -> CachePolicy {
        self.inner
            .policies
            .read()
            .get(backend)
            .copied()
            .unwrap_or(self.inner.default_policy)
    }

    /// Resolve `key`, calling `fetch` only when no usable value is cached.
    ///
    /// Backend errors are returned unchanged when no usable value exists.
    pub async fn get<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Secret>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Secret>> + Send + 'static,
    {
        let policy = self.policy_for(&key.backend);

        let flight = {
            let now = Instant::now();
            let mut state = self.inner.state.lock();

            let cached = state
                .entries
                .get(key)
                .map(|entry| (entry.freshness(now), entry.value.clone()));

            match cached {
                Some((Freshness::Fresh, value)) => {
                    tracing::trace!(key = %key, "cache hit");
                    return Ok(value);
                }
                Some((Freshness::Stale, value)) => {
                    if !state.revalidating.contains_key(key) {
                        state.next_ticket += 1;
                        let ticket = state.next_ticket;
                        state.revalidating.insert(key.clone(), ticket);
                        tracing::debug!(key = %key, "serving stale value, revalidating");
                        self.spawn_revalidation(key.clone(), ticket, policy, fetch());
                    }
                    return Ok(value);
                }
                Some((Freshness::Expired, _)) => {
                    tracing::debug!(key = %key, "evicting entry past its stale window");
                    state.entries.remove(key);
                }
                None => {}
            }

            state
                .inflight
                .entry(key.clone())
                .or_insert_with(|| {
                    tracing::debug!(key = %key, "cache miss, fetching from backend");
                    Arc::new(Flight {
                        result: OnceCell::new(),
                    })
                })
                .clone()
        };

        let leader = &flight;
        flight
            .result
            .get_or_init(move || async move {
                let result = fetch().await;
                self.complete_flight(key, leader, &result, &policy);
                result
            })
            .await
            .clone()
    }

    fn complete_flight(
        &self,
        key: &CacheKey,
        flight: &Arc<Flight>,
        result: &Result<Secret>,
        policy: &CachePolicy,
    ) {
        let mut state = self.inner.state.lock();

        let current = state
            .inflight
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(registered, flight));
        if !current {
            tracing::debug!(key = %key, "fetch overtaken by invalidation, not caching");
            return;
        }
        state.inflight.remove(key);

        match result {
            Ok(value) => {
                let entry = CacheEntry::new(value.clone(), Instant::now(), policy);
                state.entries.insert(key.clone(), entry);
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "fetch failed");
            }
        }
    }

    fn spawn_revalidation<Fut>(&self, key: CacheKey, ticket: u64, policy: CachePolicy, fetch: Fut)
    where
        Fut: Future<Output = Result<Secret>> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let result = fetch.await;
            cache.finish_revalidation(&key, ticket, &policy, result);
        });
    }

    fn finish_revalidation(
        &self,
        key: &CacheKey,
        ticket: u64,
        policy: &CachePolicy,
        result: Result<Secret>,
    ) {
        let mut state = self.inner.state.lock();

        if state.revalidating.get(key) != Some(&ticket) {
            tracing::debug!(key = %key, "revalidation overtaken by invalidation, discarding");
            return;
        }
        state.revalidating.remove(key);

        match result {
            Ok(value) => {
                tracing::debug!(key = %key, "revalidated cache entry");
                state
                    .entries
                    .insert(key.clone(), CacheEntry::new(value, Instant::now(), policy));
            }
            Err(e) if e.is_retryable() => {
                if let Some(entry) = state.entries.get_mut(key) {
                    tracing::warn!(key = %key, error = %e, "revalidation failed, keeping stale value");
                    entry.extend_staleness(policy);
                    entry.last_error = Some(e);
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "revalidation failed, evicting entry");
                state.entries.remove(key);
            }
        }
    }

    /// Remove every entry of a secret across all pinned versions and latest.
    ///
    /// In-flight fetches and revalidations for the secret are detached so
    /// their results are not cached. Returns the number of entries removed;
    /// a miss is a no-op.
    pub fn invalidate(&self, backend: &BackendId, name: &str) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();

        state.entries.retain(|key, _| !key.matches(backend, name));
        state.inflight.retain(|key, _| !key.matches(backend, name));
        state.revalidating.retain(|key, _| !key.matches(backend, name));

        let removed = before - state.entries.len();
        if removed > 0 {
            tracing::debug!(backend = %backend, name = %name, removed, "invalidated cached secret");
        }
        removed
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.inflight.clear();
        state.revalidating.clear();
        tracing::info!(count, "cleared resolution cache");
    }

    /// Drop entries whose stale window has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.freshness(now) != Freshness::Expired);
        let purged = before - state.entries.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired cache entries");
        }
        purged
    }

    /// Purge expired entries every `interval` until cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.purge_expired();
                    }
                }
            }
        })
    }

    /// Metadata of the entry for `key`, if cached.
    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.inner.state.lock().entries.get(key).map(|entry| EntryInfo {
            fetched_at: entry.fetched_at,
            fresh_until: entry.fresh_until,
            stale_until: entry.stale_until,
            last_error: entry.last_error.clone(),
        })
    }

    /// Names with at least one usable entry for `backend`, sorted.
    ///
    /// Entries past their stale window are skipped even before a purge.
    pub fn cached_names(&self, backend: &BackendId) -> Vec<String> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, entry)| {
                &key.backend == backend && entry.freshness(now) != Freshness::Expired
            })
            .map(|(key, _)| key.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of entries that can still be served.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.freshness(now) != Freshness::Expired)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("entries", &self.len())
            .field("default_policy", &self.inner.default_policy)
            .finish()
    }
}
