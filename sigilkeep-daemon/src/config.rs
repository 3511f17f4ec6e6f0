//! Daemon configuration handling.
//!
//! The daemon reads `daemon.toml` from the platform config directory. The
//! `[service]` table is the engine configuration passed to
//! [`SecretService::start`](sigilkeep_core::SecretService::start).
//!
//! ```toml
//! socket_path = "/run/user/1000/sigilkeep.sock"
//! log_level = "debug"
//!
//! [service.backends.vault]
//! kind = "memory"
//! cache_ttl_seconds = 120
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sigilkeep_core::ServiceConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine configuration.
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_path() -> PathBuf {
    project_dirs()
        .as_ref()
        .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("sigilkeep.sock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/sigilkeep.sock"))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            config_path: PathBuf::new(),
            log_level: default_log_level(),
            service: ServiceConfig::default(),
        }
    }
}

/// Load configuration from the default location or create defaults.
pub fn load_config() -> Result<DaemonConfig> {
    let config_path = project_dirs()
        .as_ref()
        .map(|d| d.config_dir().join("daemon.toml"))
        .unwrap_or_else(|| PathBuf::from("sigilkeep-daemon.toml"));

    load_config_from(&config_path)
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist.
pub fn load_config_from(path: &Path) -> Result<DaemonConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))?
    } else {
        DaemonConfig::default()
    };

    config
        .service
        .validate()
        .with_context(|| format!("Invalid service configuration in {:?}", path))?;

    config.config_path = path.to_path_buf();
    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "raibid-labs", "sigilkeep")
}
