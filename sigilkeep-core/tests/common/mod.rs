//! Shared test fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sigilkeep_core::backend::{HealthStatus, LeaseGrant, Secret, SecretBackend};
use sigilkeep_core::error::{Result, SecretError};
use sigilkeep_core::BackendId;

/// Backend whose behavior is scripted by the test.
///
/// Every `set` bumps the secret's version marker. Failures injected with the
/// `fail_*` methods are returned until cleared.
#[derive(Debug)]
pub struct ScriptedBackend {
    id: BackendId,
    values: Mutex<HashMap<String, (String, u64)>>,
    fetch_failure: Mutex<Option<SecretError>>,
    marker_failure: Mutex<Option<SecretError>>,
    renew_failure: Mutex<Option<SecretError>>,
    fetch_delay: Mutex<Duration>,
    marker_delay: Mutex<Duration>,
    issue_delay: Mutex<Duration>,
    revoke_delay: Mutex<Duration>,
    lease_ttl_seconds: u64,
    renewable: bool,
    fetch_calls: AtomicUsize,
    marker_calls: AtomicUsize,
    renew_calls: AtomicUsize,
    issued: AtomicUsize,
    revoked: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: BackendId::new(id),
            values: Mutex::new(HashMap::new()),
            fetch_failure: Mutex::new(None),
            marker_failure: Mutex::new(None),
            renew_failure: Mutex::new(None),
            fetch_delay: Mutex::new(Duration::ZERO),
            marker_delay: Mutex::new(Duration::ZERO),
            issue_delay: Mutex::new(Duration::ZERO),
            revoke_delay: Mutex::new(Duration::ZERO),
            lease_ttl_seconds: 900,
            renewable: true,
            fetch_calls: AtomicUsize::new(0),
            marker_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub fn with_lease_ttl(mut self, ttl_seconds: u64) -> Self {
        self.lease_ttl_seconds = ttl_seconds;
        self
    }

    pub fn non_renewable(mut self) -> Self {
        self.renewable = false;
        self
    }

    /// Set the current value, bumping the version marker.
    pub fn set(&self, name: &str, value: &str) {
        let mut values = self.values.lock();
        let version = values.get(name).map(|(_, v)| v + 1).unwrap_or(1);
        values.insert(name.to_string(), (value.to_string(), version));
    }

    pub fn fail_fetch(&self, error: Option<SecretError>) {
        *self.fetch_failure.lock() = error;
    }

    pub fn fail_markers(&self, error: Option<SecretError>) {
        *self.marker_failure.lock() = error;
    }

    pub fn fail_renewals(&self, error: Option<SecretError>) {
        *self.renew_failure.lock() = error;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn set_marker_delay(&self, delay: Duration) {
        *self.marker_delay.lock() = delay;
    }

    pub fn set_issue_delay(&self, delay: Duration) {
        *self.issue_delay.lock() = delay;
    }

    pub fn set_revoke_delay(&self, delay: Duration) {
        *self.revoke_delay.lock() = delay;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn marker_calls(&self) -> usize {
        self.marker_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }

    fn grant(&self, lease_id: String) -> LeaseGrant {
        let mut data = BTreeMap::new();
        data.insert("username".to_string(), Secret::new("scripted-user"));
        data.insert("password".to_string(), Secret::new(format!("pw-{}", lease_id)));
        LeaseGrant {
            lease_id,
            data,
            ttl_seconds: self.lease_ttl_seconds,
            renewable: self.renewable,
        }
    }
}

#[async_trait]
impl SecretBackend for ScriptedBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn fetch(&self, name: &str, _version: Option<&str>) -> Result<Secret> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.fetch_failure.lock().clone() {
            return Err(error);
        }
        self.values
            .lock()
            .get(name)
            .map(|(value, _)| Secret::new(value.clone()))
            .ok_or_else(|| SecretError::not_found(self.id.as_str(), name))
    }

    async fn store(&self, name: &str, value: &Secret) -> Result<()> {
        self.set(name, value.expose());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.values.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }

    async fn version_marker(&self, name: &str) -> Result<String> {
        self.marker_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.marker_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.marker_failure.lock().clone() {
            return Err(error);
        }
        self.values
            .lock()
            .get(name)
            .map(|(_, version)| version.to_string())
            .ok_or_else(|| SecretError::not_found(self.id.as_str(), name))
    }

    async fn issue_lease(&self, role: &str) -> Result<LeaseGrant> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.issue_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.grant(format!("{}/{}/{}", self.id, role, n)))
    }

    async fn renew_lease(&self, lease_id: &str) -> Result<LeaseGrant> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.renew_failure.lock().clone() {
            return Err(error);
        }
        Ok(self.grant(lease_id.to_string()))
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        let delay = *self.revoke_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.revoked.lock().push(lease_id.to_string());
        Ok(())
    }
}

/// Yield to the scheduler until `condition` holds, bounded by `attempts`.
pub async fn wait_until(mut condition: impl FnMut() -> bool, attempts: usize) -> bool {
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}
