//! TOML configuration for runscope.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration. The file path can be forced with the
//! `RUNSCOPE_CONFIG` environment variable.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::MergePolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RUNSCOPE_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "runscope.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunscopeConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunscopeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runscope configuration");
        Ok(config)
    }

    /// Try, in order: the file named by `RUNSCOPE_CONFIG`, `./runscope.toml`,
    /// then compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RUNSCOPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit `--config` path must load; otherwise fall back as in
    /// [`RunscopeConfig::load_or_default`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            enforce_monotonic_results: self.session.enforce_monotonic_results,
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Where run snapshots are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Base URL of the hub, without the `/api` suffix.
    pub base_url: String,
    /// Project identifier as used in hub URLs.
    pub project: String,
    pub app_id: u64,
    pub test_id: u64,
    pub request_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            project: "default".to_string(),
            app_id: 0,
            test_id: 0,
            request_timeout_secs: 10,
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a snapshot-failure notice stays visible (seconds).
    pub notice_ttl_secs: u64,
    /// Reject updates that would move a finished result back to open.
    pub enforce_monotonic_results: bool,
    /// Capacity of the in-process event channel.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            notice_ttl_secs: 5,
            enforce_monotonic_results: true,
            event_buffer: 1024,
        }
    }
}

impl SessionConfig {
    /// Capped at one day.
    pub fn notice_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notice_ttl_secs.min(86_400) as i64)
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address for the read API.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
