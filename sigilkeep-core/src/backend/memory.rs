//! In-memory secret backend implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChangeNotice, HealthStatus, LeaseGrant, Secret, SecretBackend};
use crate::error::{Result, SecretError};
use crate::model::BackendId;

const DEFAULT_LEASE_TTL_SECONDS: u64 = 3600;
const CHANGE_FEED_CAPACITY: usize = 64;

/// In-memory, versioned secret backend for testing and development.
///
/// Every `store` appends a new version (numbered from 1) and notifies open
/// change feeds. Leases are simulated with random credentials.
///
/// This backend is not persistent; data is lost when the process exits.
pub struct MemoryBackend {
    id: BackendId,
    versions: RwLock<HashMap<String, Vec<Secret>>>,
    leases: RwLock<HashMap<String, String>>,
    feeds: RwLock<Vec<mpsc::Sender<ChangeNotice>>>,
    lease_ttl_seconds: u64,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new(id: impl Into<BackendId>) -> Self {
        Self {
            id: id.into(),
            versions: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            feeds: RwLock::new(Vec::new()),
            lease_ttl_seconds: DEFAULT_LEASE_TTL_SECONDS,
        }
    }

    /// Create a memory backend with initial data (each value becomes version 1).
    pub fn with_data(id: impl Into<BackendId>, data: HashMap<String, Secret>) -> Self {
        let backend = Self::new(id);
        {
            let mut versions = backend.versions.write();
            for (name, value) in data {
                versions.insert(name, vec![value]);
            }
        }
        backend
    }

    /// Set the TTL granted to simulated leases.
    pub fn with_lease_ttl(mut self, ttl_seconds: u64) -> Self {
        self.lease_ttl_seconds = ttl_seconds;
        self
    }

    /// Number of versions stored for a secret.
    pub fn version_count(&self, name: &str) -> usize {
        self.versions.read().get(name).map(Vec::len).unwrap_or(0)
    }

    /// Number of leases currently issued and not revoked.
    pub fn outstanding_leases(&self) -> usize {
        self.leases.read().len()
    }

    fn notify(&self, notice: ChangeNotice) {
        let mut feeds = self.feeds.write();
        feeds.retain(|tx| match tx.try_send(notice.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(backend = %self.id, "change feed full, dropping notice");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn grant(&self, lease_id: String, role: &str) -> LeaseGrant {
        let mut data = BTreeMap::new();
        let suffix = Uuid::new_v4().simple().to_string();
        data.insert(
            "username".to_string(),
            Secret::new(format!("{}-{}", role, &suffix[..8])),
        );
        data.insert("password".to_string(), Secret::new(suffix));

        LeaseGrant {
            lease_id,
            data,
            ttl_seconds: self.lease_ttl_seconds,
            renewable: true,
        }
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("id", &self.id)
            .field("secrets_count", &self.versions.read().len())
            .finish()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn fetch(&self, name: &str, version: Option<&str>) -> Result<Secret> {
        let versions = self.versions.read();
        let history = versions
            .get(name)
            .ok_or_else(|| SecretError::not_found(self.id.as_str(), name))?;

        let found = match version {
            None => history.last(),
            Some(v) => v
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|index| history.get(index)),
        };

        found.cloned().ok_or_else(|| {
            SecretError::not_found(
                self.id.as_str(),
                format!("{}#{}", name, version.unwrap_or_default()),
            )
        })
    }

    async fn store(&self, name: &str, value: &Secret) -> Result<()> {
        let version = {
            let mut versions = self.versions.write();
            let history = versions.entry(name.to_string()).or_default();
            history.push(value.clone());
            history.len()
        };

        tracing::debug!(backend = %self.id, name = %name, version, "stored secret version");
        self.notify(ChangeNotice {
            secret_name: name.to_string(),
            new_version: Some(version.to_string()),
        });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.versions.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }

    async fn version_marker(&self, name: &str) -> Result<String> {
        match self.version_count(name) {
            0 => Err(SecretError::not_found(self.id.as_str(), name)),
            n => Ok(n.to_string()),
        }
    }

    fn subscribe_changes(&self) -> Option<mpsc::Receiver<ChangeNotice>> {
        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY);
        self.feeds.write().push(tx);
        Some(rx)
    }

    async fn issue_lease(&self, role: &str) -> Result<LeaseGrant> {
        let lease_id = format!("{}/{}/{}", self.id, role, Uuid::new_v4());
        self.leases.write().insert(lease_id.clone(), role.to_string());
        Ok(self.grant(lease_id, role))
    }

    async fn renew_lease(&self, lease_id: &str) -> Result<LeaseGrant> {
        let role = self
            .leases
            .read()
            .get(lease_id)
            .cloned()
            .ok_or_else(|| SecretError::LeaseNotFound {
                lease_id: lease_id.to_string(),
            })?;
        Ok(self.grant(lease_id.to_string(), &role))
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        self.leases.write().remove(lease_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_fetch() {
        let backend = MemoryBackend::new("vault");
        backend.store("db", &Secret::new("v1")).await.unwrap();
        backend.store("db", &Secret::new("v2")).await.unwrap();

        assert_eq!(backend.fetch("db", None).await.unwrap().expose(), "v2");
        assert_eq!(backend.fetch("db", Some("1")).await.unwrap().expose(), "v1");
        assert!(matches!(
            backend.fetch("db", Some("9")).await,
            Err(SecretError::NotFound { .. })
        ));
        assert!(matches!(
            backend.fetch("missing", None).await,
            Err(SecretError::NotFound { .. })
        ));
        assert_eq!(backend.version_marker("db").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_change_feed_receives_store() {
        let backend = MemoryBackend::new("vault");
        let mut feed = backend.subscribe_changes().unwrap();

        backend.store("api-key", &Secret::new("k1")).await.unwrap();

        let notice = feed.recv().await.unwrap();
        assert_eq!(notice.secret_name, "api-key");
        assert_eq!(notice.new_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_lease_roundtrip() {
        let backend = MemoryBackend::new("vault").with_lease_ttl(60);
        let grant = backend.issue_lease("readonly").await.unwrap();
        assert_eq!(grant.ttl_seconds, 60);
        assert!(grant.data.contains_key("username"));
        assert_eq!(backend.outstanding_leases(), 1);

        let renewed = backend.renew_lease(&grant.lease_id).await.unwrap();
        assert_eq!(renewed.lease_id, grant.lease_id);

        backend.revoke_lease(&grant.lease_id).await.unwrap();
        assert_eq!(backend.outstanding_leases(), 0);
        assert!(backend.renew_lease(&grant.lease_id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let mut data = HashMap::new();
        data.insert("b".to_string(), Secret::new("2"));
        data.insert("a".to_string(), Secret::new("1"));
        let backend = MemoryBackend::with_data("aws", data);

        assert_eq!(backend.list().await.unwrap(), vec!["a", "b"]);
    }
}
