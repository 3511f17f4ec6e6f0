//! Engine configuration.
//!
//! These types are deserialized by whatever loads configuration (the daemon
//! reads them from TOML). Every field has a default so partial tables work.
//!
//! ```toml
//! [backends.vault]
//! kind = "memory"
//! cache_ttl_seconds = 300
//!
//! [backends.vault.rotation]
//! enabled = true
//! mode = "poll"
//! poll_interval_seconds = 60
//!
//! [backends.vault.leases]
//! enabled = true
//! renewal_buffer = 0.66
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::error::SigilkeepError;
use crate::lease::RenewalPolicy;
use crate::review::ReviewSchedule;
use crate::watcher::WatchStrategy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Backends keyed by discriminant.
    pub backends: BTreeMap<String, BackendConfig>,

    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,

    /// Upper bound on shutdown, including best-effort lease revocation.
    pub shutdown_timeout_seconds: u64,

    /// How often review schedules are checked. Disabled when absent.
    pub review_check_interval_seconds: Option<u64>,

    /// How often cache entries past their stale window are evicted.
    pub cache_sweep_interval_seconds: u64,

    /// Review schedules for secrets that are not rotated automatically.
    pub reviews: Vec<ReviewSchedule>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backends: BTreeMap::new(),
            event_capacity: 256,
            shutdown_timeout_seconds: 5,
            review_check_interval_seconds: None,
            cache_sweep_interval_seconds: 60,
            reviews: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), SigilkeepError> {
        if self.event_capacity == 0 {
            return Err(SigilkeepError::config("event_capacity must be positive"));
        }
        if self.cache_sweep_interval_seconds == 0 {
            return Err(SigilkeepError::config(
                "cache_sweep_interval_seconds must be positive",
            ));
        }
        if self.review_check_interval_seconds == Some(0) {
            return Err(SigilkeepError::config(
                "review_check_interval_seconds must be positive",
            ));
        }
        for (id, backend) in &self.backends {
            backend
                .validate()
                .map_err(|e| SigilkeepError::config(format!("backend '{}': {}", id, e)))?;
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Factory used to construct the backend (`memory`, `env`, ...).
    pub kind: String,

    /// Freshness window of cached values.
    pub cache_ttl_seconds: u64,

    /// How long past freshness a value may still be served while it is
    /// revalidated. Defaults to the TTL; `0` disables stale serving.
    pub stale_window_seconds: Option<u64>,

    /// Hard cap on staleness measured from the last successful fetch.
    pub max_stale_seconds: u64,

    pub rotation: RotationConfig,

    pub leases: LeaseConfig,

    /// Factory-specific settings (e.g., `prefix` for `env`).
    pub options: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            cache_ttl_seconds: 300,
            stale_window_seconds: None,
            max_stale_seconds: 3600,
            rotation: RotationConfig::default(),
            leases: LeaseConfig::default(),
            options: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<(), String> {
        if self.cache_ttl_seconds == 0 {
            return Err("cache_ttl_seconds must be positive".to_string());
        }
        self.rotation.validate()?;
        self.leases.validate()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        let ttl = Duration::from_secs(self.cache_ttl_seconds);
        CachePolicy {
            ttl,
            stale_window: Duration::from_secs(
                self.stale_window_seconds.unwrap_or(self.cache_ttl_seconds),
            ),
            max_stale: Duration::from_secs(self.max_stale_seconds),
        }
    }
}

/// How a rotation watcher detects upstream changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Periodically compare version markers.
    #[default]
    Poll,
    /// Consume the backend's push notifications.
    Subscribe,
}

/// Rotation watching for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enabled: bool,
    pub mode: RotationMode,
    pub poll_interval_seconds: u64,
    /// Ceiling of the exponential backoff applied after poll failures.
    pub max_backoff_seconds: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RotationMode::Poll,
            poll_interval_seconds: 60,
            max_backoff_seconds: 900,
        }
    }
}

impl RotationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.poll_interval_seconds == 0 {
            return Err("rotation.poll_interval_seconds must be positive".to_string());
        }
        if self.max_backoff_seconds < self.poll_interval_seconds {
            return Err(
                "rotation.max_backoff_seconds must not be below poll_interval_seconds".to_string(),
            );
        }
        Ok(())
    }

    pub fn strategy(&self) -> WatchStrategy {
        match self.mode {
            RotationMode::Poll => WatchStrategy::Poll {
                interval: Duration::from_secs(self.poll_interval_seconds),
                max_backoff: Duration::from_secs(self.max_backoff_seconds),
            },
            RotationMode::Subscribe => WatchStrategy::Subscribe,
        }
    }
}

/// Dynamic credential management for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub enabled: bool,

    /// Fraction of the TTL after which renewal is attempted.
    #[serde(alias = "renewal_fraction")]
    pub renewal_buffer: f64,

    pub max_renewal_attempts: u32,

    /// Initial delay between failed renewal attempts, doubled each time.
    pub renewal_backoff_seconds: u64,

    /// Bound on each best-effort revoke call.
    pub revoke_timeout_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            renewal_buffer: 2.0 / 3.0,
            max_renewal_attempts: 3,
            renewal_backoff_seconds: 5,
            revoke_timeout_seconds: 5,
        }
    }
}

impl LeaseConfig {
    fn validate(&self) -> Result<(), String> {
        if !(self.renewal_buffer > 0.0 && self.renewal_buffer < 1.0) {
            return Err("leases.renewal_buffer must be within (0, 1)".to_string());
        }
        if self.max_renewal_attempts == 0 {
            return Err("leases.max_renewal_attempts must be positive".to_string());
        }
        Ok(())
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            renewal_fraction: self.renewal_buffer,
            max_attempts: self.max_renewal_attempts,
            backoff: Duration::from_secs(self.renewal_backoff_seconds),
            revoke_timeout: Duration::from_secs(self.revoke_timeout_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());

        let backend = BackendConfig::default();
        let policy = backend.cache_policy();
        assert_eq!(policy.ttl, Duration::from_secs(300));
        assert_eq!(policy.stale_window, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({
            "backends": {
                "vault": {
                    "cache_ttl_seconds": 30,
                    "rotation": { "enabled": true, "mode": "subscribe" },
                    "leases": { "enabled": true, "renewal_fraction": 0.5 }
                }
            }
        });

        let config: ServiceConfig = serde_json::from_value(json).unwrap();
        let vault = &config.backends["vault"];
        assert_eq!(vault.kind, "memory");
        assert_eq!(vault.cache_ttl_seconds, 30);
        assert_eq!(vault.rotation.mode, RotationMode::Subscribe);
        assert!(matches!(vault.rotation.strategy(), WatchStrategy::Subscribe));
        assert_eq!(vault.leases.renewal_buffer, 0.5);
        assert_eq!(vault.leases.max_renewal_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = ServiceConfig::default();
        let mut backend = BackendConfig::default();
        backend.leases.renewal_buffer = 1.5;
        config.backends.insert("vault".to_string(), backend);
        assert!(matches!(config.validate(), Err(SigilkeepError::Config { .. })));

        let mut config = ServiceConfig::default();
        let mut backend = BackendConfig::default();
        backend.cache_ttl_seconds = 0;
        config.backends.insert("aws".to_string(), backend);
        assert!(config.validate().is_err());
    }
}
