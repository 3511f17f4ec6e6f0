//! API request/response types for the daemon JSON-RPC interface.

use serde::{Deserialize, Serialize};
use sigilkeep_core::{HealthStatus, Lease, LeaseState};
use std::collections::BTreeMap;

/// Response containing a resolved value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    /// The resolved value, or the input with every reference substituted
    pub value: String,
}

/// Response after storing a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Confirmation message
    pub message: String,
}

/// Response after invalidating cached entries of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    /// Number of cache entries removed
    pub invalidated: usize,
}

/// A tracked lease as reported by `list_leases`.
///
/// Credential material is only returned by `request_lease` and `renew_lease`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub backend: String,
    pub role: String,
    pub state: LeaseState,
    pub renewable: bool,
    /// TTL granted by the last issue or renewal
    pub ttl_seconds: u64,
    /// Seconds until expiry
    pub remaining_seconds: u64,
    /// Expiration timestamp (RFC 3339)
    pub expires_at: String,
}

impl From<&Lease> for LeaseInfo {
    fn from(lease: &Lease) -> Self {
        Self {
            lease_id: lease.lease_id.clone(),
            backend: lease.backend.to_string(),
            role: lease.role.clone(),
            state: lease.state,
            renewable: lease.renewable,
            ttl_seconds: lease.ttl_seconds,
            remaining_seconds: lease.time_remaining().as_secs(),
            expires_at: lease.expires_at_utc().to_rfc3339(),
        }
    }
}

/// Response containing a lease together with its credential material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    #[serde(flatten)]
    pub lease: LeaseInfo,
    pub data: BTreeMap<String, String>,
}

impl From<&Lease> for LeaseResponse {
    fn from(lease: &Lease) -> Self {
        Self {
            lease: LeaseInfo::from(lease),
            data: lease
                .data
                .iter()
                .map(|(key, value)| (key.clone(), value.expose().to_string()))
                .collect(),
        }
    }
}

/// Response after revoking a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeLeaseResponse {
    /// Confirmation message
    pub message: String,
}

/// Response containing every active lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListLeasesResponse {
    pub leases: Vec<LeaseInfo>,
}

/// Response containing the health of every registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub backends: BTreeMap<String, HealthStatus>,
}
