//! Dynamic credential lease management.
//!
//! Leases are issued by a backend for a role, renewed in the background
//! before they lapse, and revoked on release or shutdown. Lease values are
//! never refetched; a lease that cannot be renewed becomes `Expired` and the
//! caller must request a new one.
//!
//! ```text
//! Active ──timer──▶ Renewing ──ok──▶ Active
//!                      └──retries exhausted──▶ Expired
//! any ──revoke / shutdown──▶ Revoked
//! ```
//!
//! Each tracked lease owns at most one timer task. The table lock guards
//! metadata only and is never held across a backend call. Expired and
//! revoked leases leave the table; only their final state is remembered, for
//! a bounded number of recent ids.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::backend::{BackendRegistry, LeaseGrant, Secret};
use crate::cache::ResolutionCache;
use crate::error::{Result, SecretError};
use crate::events::{EventBus, SecretEvent};
use crate::model::BackendId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Active,
    Renewing,
    Expired,
    Revoked,
}

/// Renewal behavior for one backend's leases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalPolicy {
    /// Fraction of the TTL after which renewal starts.
    pub renewal_fraction: f64,
    /// Renewal attempts before the lease is given up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, doubled after each failure.
    pub backoff: Duration,
    /// Bound on each best-effort revoke call.
    pub revoke_timeout: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            renewal_fraction: 2.0 / 3.0,
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            revoke_timeout: Duration::from_secs(5),
        }
    }
}

impl RenewalPolicy {
    /// Delay from issuance (or renewal) until the next renewal attempt.
    pub fn renewal_delay(&self, ttl: Duration) -> Duration {
        let millis = ttl.as_millis() as f64 * self.renewal_fraction;
        Duration::from_millis(millis.round() as u64)
    }
}

/// A backend-issued dynamic credential.
///
/// Callers receive copies; the manager owns the tracked instance.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub backend: BackendId,
    pub role: String,
    pub data: BTreeMap<String, Secret>,
    pub ttl_seconds: u64,
    pub renewable: bool,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub state: LeaseState,
}

impl Lease {
    fn from_grant(backend: BackendId, role: &str, grant: LeaseGrant, now: Instant) -> Self {
        Self {
            lease_id: grant.lease_id,
            backend,
            role: role.to_string(),
            data: grant.data,
            ttl_seconds: grant.ttl_seconds,
            renewable: grant.renewable,
            issued_at: now,
            expires_at: now + Duration::from_secs(grant.ttl_seconds),
            state: LeaseState::Active,
        }
    }

    pub fn time_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Wall-clock expiry.
    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        let remaining = chrono::Duration::from_std(self.time_remaining())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + remaining
    }

    /// Whether the lease is still usable.
    pub fn is_active(&self) -> bool {
        matches!(self.state, LeaseState::Active | LeaseState::Renewing)
    }
}

struct LeaseSlot {
    lease: Lease,
    renew_at: Instant,
    timer: Option<JoinHandle<()>>,
}

/// Terminal states kept after a lease leaves the table.
const RETIRED_CAPACITY: usize = 1024;

/// Final states of recently retired leases, oldest evicted first.
struct RetiredLeases {
    capacity: usize,
    states: HashMap<String, LeaseState>,
    order: VecDeque<String>,
}

impl RetiredLeases {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            states: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, lease_id: String, state: LeaseState) {
        if self.states.insert(lease_id.clone(), state).is_none() {
            self.order.push_back(lease_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn get(&self, lease_id: &str) -> Option<LeaseState> {
        self.states.get(lease_id).copied()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Inner {
    registry: BackendRegistry,
    cache: ResolutionCache,
    events: EventBus,
    default_policy: RenewalPolicy,
    policies: RwLock<HashMap<BackendId, RenewalPolicy>>,
    // Lock order: `leases` before `retired`.
    leases: Mutex<HashMap<String, LeaseSlot>>,
    retired: Mutex<RetiredLeases>,
    closed: AtomicBool,
}

/// Issues, renews, and revokes leases.
///
/// Cloning is cheap; clones share the same lease table.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new(registry: BackendRegistry, cache: ResolutionCache, events: EventBus) -> Self {
        Self::with_policy(registry, cache, events, RenewalPolicy::default())
    }

    pub fn with_policy(
        registry: BackendRegistry,
        cache: ResolutionCache,
        events: EventBus,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                cache,
                events,
                default_policy: policy,
                policies: RwLock::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                retired: Mutex::new(RetiredLeases::new(RETIRED_CAPACITY)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Override the renewal policy for one backend.
    pub fn set_policy(&self, backend: BackendId, policy: RenewalPolicy) {
        self.inner.policies.write().insert(backend, policy);
    }

    pub fn policy_for(&self, backend: &BackendId) -> RenewalPolicy {
        self.inner
            .policies
            .read()
            .get(backend)
            .copied()
            .unwrap_or(self.inner.default_policy)
    }

    /// Request a new dynamic credential for `role`.
    pub async fn request_dynamic(&self, backend: &BackendId, role: &str) -> Result<Lease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SecretError::unavailable(
                backend.as_str(),
                "lease manager is shut down",
            ));
        }

        let integration = self.inner.registry.get(backend)?;
        let grant = integration.issue_lease(role).await?;
        let lease = Lease::from_grant(backend.clone(), role, grant, Instant::now());

        // Shutdown may have drained the table while the backend was issuing.
        let tracked = {
            let mut leases = self.inner.leases.lock();
            if self.inner.closed.load(Ordering::SeqCst) {
                false
            } else {
                let renew_at = self.next_timer_at(&lease);
                let timer = self.schedule(&lease, renew_at);
                leases.insert(
                    lease.lease_id.clone(),
                    LeaseSlot {
                        lease: lease.clone(),
                        renew_at,
                        timer: Some(timer),
                    },
                );
                true
            }
        };

        if !tracked {
            tracing::warn!(
                lease_id = %lease.lease_id,
                backend = %backend,
                "lease granted after shutdown, revoking"
            );
            revoke_upstream(
                &self.inner.registry,
                &lease,
                self.policy_for(backend).revoke_timeout,
            )
            .await;
            return Err(SecretError::unavailable(
                backend.as_str(),
                "lease manager is shut down",
            ));
        }

        tracing::info!(
            lease_id = %lease.lease_id,
            backend = %backend,
            role = %role,
            ttl_seconds = lease.ttl_seconds,
            "issued lease"
        );
        Ok(lease)
    }

    /// Renew a lease now.
    ///
    /// An expired lease fails with `LeaseExpired`; request a new lease
    /// instead of retrying.
    pub async fn renew_lease(&self, lease_id: &str) -> Result<Lease> {
        let backend_id = {
            let now = Instant::now();
            let mut leases = self.inner.leases.lock();
            let Some(slot) = leases.get_mut(lease_id) else {
                let retired = self.inner.retired.lock().get(lease_id);
                return Err(match retired {
                    Some(LeaseState::Expired) => SecretError::LeaseExpired {
                        lease_id: lease_id.to_string(),
                    },
                    Some(state) => SecretError::RenewalFailed {
                        lease_id: lease_id.to_string(),
                        message: format!("lease is {:?}", state).to_lowercase(),
                    },
                    None => SecretError::LeaseNotFound {
                        lease_id: lease_id.to_string(),
                    },
                });
            };

            match slot.lease.state {
                LeaseState::Active if now >= slot.lease.expires_at => {
                    drop(leases);
                    self.expire(lease_id);
                    return Err(SecretError::LeaseExpired {
                        lease_id: lease_id.to_string(),
                    });
                }
                LeaseState::Active => {}
                state => {
                    return Err(SecretError::RenewalFailed {
                        lease_id: lease_id.to_string(),
                        message: format!("lease is {:?}", state).to_lowercase(),
                    });
                }
            }
            if !slot.lease.renewable {
                return Err(SecretError::RenewalFailed {
                    lease_id: lease_id.to_string(),
                    message: "lease is not renewable".to_string(),
                });
            }

            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.lease.state = LeaseState::Renewing;
            slot.lease.backend.clone()
        };

        let outcome = match self.inner.registry.get(&backend_id) {
            Ok(backend) => backend.renew_lease(lease_id).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(grant) => self
                .complete_renewal(lease_id, grant)
                .ok_or_else(|| SecretError::LeaseNotFound {
                    lease_id: lease_id.to_string(),
                }),
            Err(SecretError::LeaseExpired { .. }) => {
                self.expire(lease_id);
                Err(SecretError::LeaseExpired {
                    lease_id: lease_id.to_string(),
                })
            }
            Err(e) => {
                self.restore_active(lease_id);
                Err(SecretError::RenewalFailed {
                    lease_id: lease_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Revoke a lease and stop tracking it.
    ///
    /// The backend revoke is best effort and bounded by the backend's
    /// revoke timeout; the lease is released locally either way. Revoking an
    /// id that is not live fails with `LeaseNotFound`.
    pub async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        let mut slot = {
            let mut leases = self.inner.leases.lock();
            let slot = leases
                .remove(lease_id)
                .ok_or_else(|| SecretError::LeaseNotFound {
                    lease_id: lease_id.to_string(),
                })?;
            self.inner
                .retired
                .lock()
                .record(lease_id.to_string(), LeaseState::Revoked);
            slot
        };

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.lease.state = LeaseState::Revoked;

        self.inner
            .cache
            .invalidate(&slot.lease.backend, &slot.lease.role);
        revoke_upstream(
            &self.inner.registry,
            &slot.lease,
            self.policy_for(&slot.lease.backend).revoke_timeout,
        )
        .await;

        tracing::info!(lease_id = %lease_id, backend = %slot.lease.backend, "revoked lease");
        Ok(())
    }

    /// Leases that are `Active` or `Renewing`, oldest first.
    pub fn list_active_leases(&self) -> Vec<Lease> {
        let mut active: Vec<Lease> = self
            .inner
            .leases
            .lock()
            .values()
            .filter(|slot| slot.lease.is_active())
            .map(|slot| slot.lease.clone())
            .collect();
        active.sort_by_key(|lease| lease.issued_at);
        active
    }

    /// Copy of a live lease.
    pub fn get_lease(&self, lease_id: &str) -> Option<Lease> {
        self.inner
            .leases
            .lock()
            .get(lease_id)
            .map(|slot| slot.lease.clone())
    }

    /// State of a live lease, or the final state of a recently retired one.
    pub fn lease_state(&self, lease_id: &str) -> Option<LeaseState> {
        let leases = self.inner.leases.lock();
        match leases.get(lease_id) {
            Some(slot) => Some(slot.lease.state),
            None => self.inner.retired.lock().get(lease_id),
        }
    }

    /// Number of live leases.
    pub fn tracked_leases(&self) -> usize {
        self.inner.leases.lock().len()
    }

    /// Revoke every tracked lease.
    ///
    /// Revocations run concurrently; whatever has not finished after
    /// `timeout` is abandoned since leftover leases lapse on their own.
    /// Returns the number of leases released.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);

        let slots: Vec<LeaseSlot> = {
            let mut leases = self.inner.leases.lock();
            let mut retired = self.inner.retired.lock();
            let drained: Vec<LeaseSlot> = leases
                .drain()
                .map(|(lease_id, slot)| {
                    retired.record(lease_id, LeaseState::Revoked);
                    slot
                })
                .collect();
            drained
        };
        let count = slots.len();
        if count == 0 {
            return 0;
        }

        let mut revocations = JoinSet::new();
        for mut slot in slots {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.lease.state = LeaseState::Revoked;

            let registry = self.inner.registry.clone();
            let per_call = self.policy_for(&slot.lease.backend).revoke_timeout;
            revocations.spawn(async move {
                revoke_upstream(&registry, &slot.lease, per_call).await;
            });
        }

        let drained = tokio::time::timeout(timeout, async {
            while revocations.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                pending = revocations.len(),
                "shutdown timeout reached, abandoning lease revocations"
            );
            revocations.abort_all();
        }

        tracing::info!(count, "released all leases");
        count
    }

    fn next_timer_at(&self, lease: &Lease) -> Instant {
        if lease.renewable {
            let ttl = Duration::from_secs(lease.ttl_seconds);
            Instant::now() + self.policy_for(&lease.backend).renewal_delay(ttl)
        } else {
            lease.expires_at
        }
    }

    fn schedule(&self, lease: &Lease, at: Instant) -> JoinHandle<()> {
        let manager = self.clone();
        let lease_id = lease.lease_id.clone();
        let renewable = lease.renewable;

        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if renewable {
                manager.run_renewal(&lease_id).await;
            } else {
                manager.expire(&lease_id);
            }
        })
    }

    async fn run_renewal(&self, lease_id: &str) {
        let (backend_id, role, expires_at) = {
            let mut leases = self.inner.leases.lock();
            let Some(slot) = leases.get_mut(lease_id) else {
                return;
            };
            if slot.lease.state != LeaseState::Active {
                return;
            }
            slot.lease.state = LeaseState::Renewing;
            (
                slot.lease.backend.clone(),
                slot.lease.role.clone(),
                slot.lease.expires_at,
            )
        };

        let backend = match self.inner.registry.get(&backend_id) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(lease_id = %lease_id, error = %e, "lease backend disappeared");
                self.expire(lease_id);
                return;
            }
        };

        let policy = self.policy_for(&backend_id);
        let mut delay = policy.backoff;

        for attempt in 1..=policy.max_attempts {
            match backend.renew_lease(lease_id).await {
                Ok(grant) => {
                    self.complete_renewal(lease_id, grant);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        lease_id = %lease_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "lease renewal failed"
                    );
                    if attempt == 1 {
                        self.inner.events.publish(SecretEvent::ExpiringSoon {
                            backend: backend_id.to_string(),
                            secret_name: role.clone(),
                            expires_at: self
                                .get_lease(lease_id)
                                .map(|lease| lease.expires_at_utc())
                                .unwrap_or_else(Utc::now),
                        });
                    }
                    if matches!(e, SecretError::LeaseExpired { .. } | SecretError::LeaseNotFound { .. }) {
                        break;
                    }
                }
            }

            if attempt == policy.max_attempts {
                break;
            }
            let remaining = expires_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
            delay = delay.saturating_mul(2);

            if !self.is_renewing(lease_id) {
                return;
            }
        }

        self.expire(lease_id);
    }

    /// Install a successful renewal. Returns `None` when the lease was revoked
    /// or expired while the renewal was in flight.
    fn complete_renewal(&self, lease_id: &str, grant: LeaseGrant) -> Option<Lease> {
        let mut leases = self.inner.leases.lock();
        let slot = leases.get_mut(lease_id)?;
        if slot.lease.state != LeaseState::Renewing {
            return None;
        }

        let now = Instant::now();
        slot.lease.data = grant.data;
        slot.lease.ttl_seconds = grant.ttl_seconds;
        slot.lease.renewable = grant.renewable;
        slot.lease.expires_at = now + Duration::from_secs(grant.ttl_seconds);
        slot.lease.state = LeaseState::Active;

        slot.renew_at = self.next_timer_at(&slot.lease);
        slot.timer = Some(self.schedule(&slot.lease, slot.renew_at));

        tracing::info!(
            lease_id = %lease_id,
            ttl_seconds = slot.lease.ttl_seconds,
            "renewed lease"
        );
        Some(slot.lease.clone())
    }

    fn restore_active(&self, lease_id: &str) {
        let mut leases = self.inner.leases.lock();
        if let Some(slot) = leases.get_mut(lease_id) {
            if slot.lease.state == LeaseState::Renewing {
                slot.lease.state = LeaseState::Active;
                slot.timer = Some(self.schedule(&slot.lease, slot.renew_at));
            }
        }
    }

    fn is_renewing(&self, lease_id: &str) -> bool {
        self.inner
            .leases
            .lock()
            .get(lease_id)
            .is_some_and(|slot| slot.lease.state == LeaseState::Renewing)
    }

    fn expire(&self, lease_id: &str) {
        let (backend, role) = {
            let mut leases = self.inner.leases.lock();
            let Some(slot) = leases.remove(lease_id) else {
                return;
            };
            self.inner
                .retired
                .lock()
                .record(lease_id.to_string(), LeaseState::Expired);
            (slot.lease.backend, slot.lease.role)
        };

        self.inner.cache.invalidate(&backend, &role);
        tracing::error!(lease_id = %lease_id, backend = %backend, role = %role, "lease expired");
        self.inner.events.publish(SecretEvent::LeaseExpired {
            backend: backend.to_string(),
            lease_id: lease_id.to_string(),
            role,
        });
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("leases", &self.inner.leases.lock().len())
            .field("retired", &self.inner.retired.lock().len())
            .field("default_policy", &self.inner.default_policy)
            .finish()
    }
}

async fn revoke_upstream(registry: &BackendRegistry, lease: &Lease, limit: Duration) {
    let backend = match registry.get(&lease.backend) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(lease_id = %lease.lease_id, error = %e, "cannot revoke lease upstream");
            return;
        }
    };

    match tokio::time::timeout(limit, backend.revoke_lease(&lease.lease_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(lease_id = %lease.lease_id, error = %e, "upstream lease revoke failed");
        }
        Err(_) => {
            tracing::warn!(lease_id = %lease.lease_id, timeout = ?limit, "upstream lease revoke timed out");
        }
    }
}
