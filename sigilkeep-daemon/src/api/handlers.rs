//! JSON-RPC API handlers for the daemon.

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use sigilkeep_core::model::is_reference;
use sigilkeep_core::{BackendId, Secret, SecretError, SecretResolver, SharedService};
use tracing::{debug, info};

use super::types::{
    HealthResponse, InvalidateResponse, LeaseInfo, LeaseResponse, ListLeasesResponse,
    ResolveResponse, RevokeLeaseResponse, StoreResponse,
};

/// State shared across RPC handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The running engine
    pub service: SharedService,
}

impl ApiState {
    /// Create API state around a started service.
    pub fn new(service: SharedService) -> Self {
        Self { service }
    }
}

/// JSON-RPC API trait definition.
#[rpc(server)]
pub trait SigilkeepApi {
    /// Resolve a secret reference.
    ///
    /// # Parameters
    ///
    /// - `reference`: A single reference (e.g., "${vault:db/password}"), or
    ///   text in which every embedded reference is substituted
    #[method(name = "resolve")]
    async fn resolve(&self, reference: String) -> RpcResult<ResolveResponse>;

    /// Write a new value for an unpinned reference and drop cached copies.
    #[method(name = "store")]
    async fn store(&self, reference: String, value: String) -> RpcResult<StoreResponse>;

    /// Drop every cached version of a secret.
    #[method(name = "invalidate")]
    async fn invalidate(&self, backend: String, name: String) -> RpcResult<InvalidateResponse>;

    /// Request a dynamic credential for `role` from `backend`.
    #[method(name = "request_lease")]
    async fn request_lease(&self, backend: String, role: String) -> RpcResult<LeaseResponse>;

    /// Renew a lease immediately.
    #[method(name = "renew_lease")]
    async fn renew_lease(&self, lease_id: String) -> RpcResult<LeaseResponse>;

    /// Release a lease.
    #[method(name = "revoke_lease")]
    async fn revoke_lease(&self, lease_id: String) -> RpcResult<RevokeLeaseResponse>;

    /// List every active lease.
    #[method(name = "list_leases")]
    async fn list_leases(&self) -> RpcResult<ListLeasesResponse>;

    /// Run every backend's health check.
    #[method(name = "health")]
    async fn health(&self) -> RpcResult<HealthResponse>;
}

/// Implementation of the Sigilkeep API.
pub struct SigilkeepApiImpl {
    state: ApiState,
}

impl SigilkeepApiImpl {
    /// Create a new API implementation with the given state.
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl SigilkeepApiServer for SigilkeepApiImpl {
    async fn resolve(&self, reference: String) -> RpcResult<ResolveResponse> {
        debug!("RPC: resolve");

        let dispatcher = self.state.service.dispatcher();
        let resolved = if is_reference(&reference) {
            dispatcher
                .resolve(&reference)
                .await
                .map(|secret| secret.expose().to_string())
        } else {
            dispatcher.resolve_template(&reference).await
        };

        Ok(ResolveResponse {
            value: resolved.map_err(secret_error)?,
        })
    }

    async fn store(&self, reference: String, value: String) -> RpcResult<StoreResponse> {
        info!("RPC: store({})", reference);

        self.state
            .service
            .dispatcher()
            .set(&reference, Secret::new(value))
            .await
            .map_err(secret_error)?;

        Ok(StoreResponse {
            message: format!("Stored {}", reference),
        })
    }

    async fn invalidate(&self, backend: String, name: String) -> RpcResult<InvalidateResponse> {
        info!("RPC: invalidate({}/{})", backend, name);

        let invalidated = self
            .state
            .service
            .cache()
            .invalidate(&BackendId::new(backend), &name);

        Ok(InvalidateResponse { invalidated })
    }

    async fn request_lease(&self, backend: String, role: String) -> RpcResult<LeaseResponse> {
        info!("RPC: request_lease({}/{})", backend, role);

        let lease = self
            .state
            .service
            .request_lease(&BackendId::new(backend), &role)
            .await
            .map_err(secret_error)?;

        Ok(LeaseResponse::from(&lease))
    }

    async fn renew_lease(&self, lease_id: String) -> RpcResult<LeaseResponse> {
        info!("RPC: renew_lease({})", lease_id);

        let lease = self
            .state
            .service
            .leases()
            .renew_lease(&lease_id)
            .await
            .map_err(secret_error)?;

        Ok(LeaseResponse::from(&lease))
    }

    async fn revoke_lease(&self, lease_id: String) -> RpcResult<RevokeLeaseResponse> {
        info!("RPC: revoke_lease({})", lease_id);

        self.state
            .service
            .leases()
            .revoke_lease(&lease_id)
            .await
            .map_err(secret_error)?;

        Ok(RevokeLeaseResponse {
            message: format!("Lease {} revoked", lease_id),
        })
    }

    async fn list_leases(&self) -> RpcResult<ListLeasesResponse> {
        debug!("RPC: list_leases");

        let leases = self
            .state
            .service
            .leases()
            .list_active_leases()
            .iter()
            .map(LeaseInfo::from)
            .collect();

        Ok(ListLeasesResponse { leases })
    }

    async fn health(&self) -> RpcResult<HealthResponse> {
        debug!("RPC: health");

        let backends = self
            .state
            .service
            .dispatcher()
            .health()
            .await
            .into_iter()
            .map(|(id, status)| (id.to_string(), status))
            .collect();

        Ok(HealthResponse { backends })
    }
}

/// JSON-RPC error code for a domain error.
///
/// Malformed references are the caller's fault and use the standard
/// invalid-params code; everything else lives in the server error range.
pub fn error_code(err: &SecretError) -> i32 {
    match err {
        SecretError::InvalidReference { .. } => ErrorCode::InvalidParams.code(),
        SecretError::NotFound { .. } => -32001,
        SecretError::PermissionDenied { .. } => -32002,
        SecretError::Unavailable { .. } => -32003,
        SecretError::AuthExpired { .. } => -32004,
        SecretError::BackendUnsupported { .. } => -32005,
        SecretError::UnknownBackend { .. } => -32006,
        SecretError::LeaseExpired { .. } => -32007,
        SecretError::RenewalFailed { .. } => -32008,
        SecretError::LeaseNotFound { .. } => -32009,
    }
}

/// Map a domain error to a JSON-RPC error object carrying its taxonomy name.
pub fn secret_error(err: SecretError) -> ErrorObject<'static> {
    ErrorObject::owned(
        error_code(&err),
        err.to_string(),
        Some(serde_json::json!({ "kind": err.kind() })),
    )
}

pub(crate) fn internal_error<E: std::fmt::Display>(err: E) -> ErrorObject<'static> {
    ErrorObject::owned(
        ErrorCode::InternalError.code(),
        format!("{}", err),
        None::<()>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_error_carries_kind() {
        let err = secret_error(SecretError::not_found("vault", "db"));
        assert_eq!(err.code(), -32001);
        assert_eq!(err.message(), "secret not found: vault/db");

        let data: serde_json::Value =
            serde_json::from_str(err.data().unwrap().get()).unwrap();
        assert_eq!(data["kind"], "NotFound");
    }

    #[test]
    fn test_invalid_reference_is_invalid_params() {
        let err = SecretError::InvalidReference {
            reference: "vault:db".to_string(),
            message: "expected ${backend:name[#version]}".to_string(),
        };
        assert_eq!(error_code(&err), -32602);
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            SecretError::not_found("a", "b"),
            SecretError::permission_denied("a", "b"),
            SecretError::unavailable("a", "b"),
            SecretError::AuthExpired {
                backend: "a".to_string(),
            },
            SecretError::unsupported("a", "b"),
            SecretError::UnknownBackend {
                backend: "a".to_string(),
            },
            SecretError::LeaseExpired {
                lease_id: "l".to_string(),
            },
            SecretError::RenewalFailed {
                lease_id: "l".to_string(),
                message: "m".to_string(),
            },
            SecretError::LeaseNotFound {
                lease_id: "l".to_string(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(error_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
