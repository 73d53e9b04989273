use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Result, TidewireError};

/// Node-wide configuration shared by every requestor, responder and broadcaster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TidewireConfig {
    /// Default timeout applied to new transactions
    pub request_timeout_ms: u64,
    /// Consumer group for load-shared delivery instead of fan-out
    pub queue_group: Option<String>,
    /// Prefix of each requestor's private reply subject
    pub reply_prefix: String,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for TidewireConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: std::env::var("TIDEWIRE_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
            queue_group: std::env::var("TIDEWIRE_QUEUE_GROUP")
                .ok()
                .filter(|s| !s.is_empty()),
            reply_prefix: std::env::var("TIDEWIRE_REPLY_PREFIX")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "requestor-id-".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "info".to_string()),
        }
    }
}

impl TidewireConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Load configuration from a TOML file (path via TIDEWIRE_CONFIG or ./tidewire.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("TIDEWIRE_CONFIG").unwrap_or_else(|_| "tidewire.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<TidewireToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Parse a TOML document over the defaults; unlike [`TidewireConfig::load`]
    /// a malformed document is an error.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t: TidewireToml = toml::from_str(s).map_err(|e| TidewireError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }
}

// TOML representation; every field is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TidewireToml {
    request_timeout_ms: Option<u64>,
    queue_group: Option<String>,
    reply_prefix: Option<String>,
    log_filter: Option<String>,
}

impl TidewireToml {
    fn overlay(self, mut base: TidewireConfig) -> TidewireConfig {
        if let Some(v) = self.request_timeout_ms {
            base.request_timeout_ms = v;
        }
        if let Some(v) = self.queue_group.filter(|s| !s.is_empty()) {
            base.queue_group = Some(v);
        }
        if let Some(v) = self.reply_prefix.filter(|s| !s.is_empty()) {
            base.reply_prefix = v;
        }
        if let Some(v) = self.log_filter {
            base.log_filter = v;
        }
        base
    }
}
