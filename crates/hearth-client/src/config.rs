//! Client configuration loaded from environment variables.
//!
//! Every setting has a default pointing at a local development backend.

use std::path::PathBuf;
use std::time::Duration;

use hearth_net::{TransportConfig, TransportError, DEFAULT_OPEN_GRACE};
use hearth_store::{Database, StoreError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Origin of the WebSocket endpoints.
    /// Env: `HEARTH_WS_BASE`
    /// Default: `ws://127.0.0.1:8000`
    pub ws_base: String,

    /// Base of the REST API, used for message history.
    /// Env: `HEARTH_API_BASE`
    /// Default: `http://127.0.0.1:8000/api`
    pub api_base: String,

    /// Directory holding the local database.
    /// Env: `HEARTH_DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Wait after the upgrade for an immediate auth close.
    /// Env: `HEARTH_OPEN_GRACE_MS`
    /// Default: `150`
    pub open_grace: Duration,

    /// Timeout for history requests.
    /// Env: `HEARTH_HTTP_TIMEOUT_SECS`
    /// Default: `15`
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_base: "ws://127.0.0.1:8000".to_string(),
            api_base: "http://127.0.0.1:8000/api".to_string(),
            data_dir: None,
            open_grace: DEFAULT_OPEN_GRACE,
            http_timeout: Duration::from_secs(15),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base) = lookup("HEARTH_WS_BASE") {
            config.ws_base = base;
        }

        if let Some(base) = lookup("HEARTH_API_BASE") {
            config.api_base = base;
        }

        if let Some(dir) = lookup("HEARTH_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(val) = lookup("HEARTH_OPEN_GRACE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.open_grace = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid HEARTH_OPEN_GRACE_MS, using default"),
            }
        }

        if let Some(val) = lookup("HEARTH_HTTP_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.http_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid HEARTH_HTTP_TIMEOUT_SECS, using default"),
            }
        }

        config
    }

    pub fn transport_config(&self) -> Result<TransportConfig, TransportError> {
        Ok(TransportConfig::new(&self.ws_base)?.with_open_grace(self.open_grace))
    }

    pub fn open_database(&self) -> Result<Database, StoreError> {
        match &self.data_dir {
            Some(dir) => Database::open_in(dir),
            None => Database::new(),
        }
    }
}
