//! Error types for Sigilkeep.
//!
//! [`SecretError`] is the shared taxonomy every backend integration maps its
//! native errors into before they reach the engine. [`SigilkeepError`] wraps it
//! together with configuration failures for service construction.

use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, SecretError>;

/// Error taxonomy shared by backends, the cache, the dispatcher, and the
/// lease manager.
///
/// The type is `Clone` so that a single in-flight fetch can hand the same
/// outcome to every caller attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// The secret does not exist in the backend.
    #[error("secret not found: {backend}/{name}")]
    NotFound { backend: String, name: String },

    /// The backend refused access to the secret.
    #[error("permission denied for {backend}/{name}")]
    PermissionDenied { backend: String, name: String },

    /// Transient failure: network, timeout, sealed backend.
    #[error("backend {backend} unavailable: {message}")]
    Unavailable { backend: String, message: String },

    /// Backend credentials expired; retryable after re-authentication.
    #[error("authentication expired for backend {backend}")]
    AuthExpired { backend: String },

    /// The backend lacks the requested capability or integration.
    #[error("backend {backend} does not support this operation: {message}")]
    BackendUnsupported { backend: String, message: String },

    /// No backend is registered for the reference discriminant.
    #[error("unknown backend: {backend}")]
    UnknownBackend { backend: String },

    /// The lease expired; a new lease must be requested.
    #[error("lease {lease_id} has expired, request a new lease")]
    LeaseExpired { lease_id: String },

    /// Renewing a lease failed.
    #[error("renewal of lease {lease_id} failed: {message}")]
    RenewalFailed { lease_id: String, message: String },

    /// No lease with this id is tracked.
    #[error("lease not found: {lease_id}")]
    LeaseNotFound { lease_id: String },

    /// A reference string could not be parsed.
    #[error("invalid reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },
}

impl SecretError {
    /// Create a not found error.
    pub fn not_found(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            backend: backend.into(),
            name: name.into(),
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self::PermissionDenied {
            backend: backend.into(),
            name: name.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported capability error.
    pub fn unsupported(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnsupported {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is transient.
    ///
    /// Retryable failures are the only ones the cache answers with a stale
    /// value; everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::AuthExpired { .. })
    }

    /// Whether the failure points at the caller's identity rather than the
    /// secret itself.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired { .. } | Self::PermissionDenied { .. }
        )
    }

    /// Stable name of the taxonomy variant, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::Unavailable { .. } => "Unavailable",
            Self::AuthExpired { .. } => "AuthExpired",
            Self::BackendUnsupported { .. } => "BackendUnsupported",
            Self::UnknownBackend { .. } => "UnknownBackend",
            Self::LeaseExpired { .. } => "LeaseExpired",
            Self::RenewalFailed { .. } => "RenewalFailed",
            Self::LeaseNotFound { .. } => "LeaseNotFound",
            Self::InvalidReference { .. } => "InvalidReference",
        }
    }
}

/// Top-level error type encompassing all Sigilkeep errors.
#[derive(Debug, Error)]
pub enum SigilkeepError {
    /// Error from a secret operation.
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl SigilkeepError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
