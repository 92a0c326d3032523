//! # Gateway Configuration
//!
//! Loads `config.json`: listener ports, per-backend upstream URIs, poll
//! intervals and optional API keys. The process refuses to start when the
//! selected backend has no usable upstream URI.

use crate::errors::ConfigError;
use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default WebSocket listen port.
pub const DEFAULT_WS_PORT: u16 = 8181;
/// Default JSON-RPC listen port.
pub const DEFAULT_RPC_PORT: u16 = 8080;
/// Default block poll interval for slow chains.
pub const DEFAULT_BLOCK_READ_INTERVAL_MS: u64 = 5_000;
/// Tron blocks arrive every 3 s; poll faster.
pub const TRON_BLOCK_READ_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Upstream request timeout, applied to every adapter HTTP call.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default)]
    pub rate_limiter: RateLimiterSettings,
    pub backends: HashMap<String, BackendConfig>,
}

fn default_ws_port() -> u16 {
    DEFAULT_WS_PORT
}

fn default_rpc_port() -> u16 {
    DEFAULT_RPC_PORT
}

fn default_upstream_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    pub rps_limit: u32,
    pub max_concurrent_requests: u32,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            rps_limit: 20,
            max_concurrent_requests: 8,
        }
    }
}

/// Per-backend upstream wiring. `uri` is mandatory for every backend;
/// the rest depends on the chain family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub uri: String,
    /// Tron solidity node; falls back to `uri` when absent.
    pub solidity_uri: Option<String>,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
    pub block_read_interval_ms: Option<u64>,
    /// Set by backends fed from an external live stream instead of height
    /// polling (Solana with an aggregator subscription).
    #[serde(default)]
    pub disable_height_processing: bool,
}

impl BackendConfig {
    /// Resolves the optional API key from the environment. A configured but
    /// unset variable is downgraded to a warning; only URIs are fatal.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => {
                warn!(target: "config", env = var, "API key variable not set, continuing without key");
                None
            }
        }
    }

    pub fn block_read_interval(&self, backend: Backend) -> Duration {
        let default_ms = match backend {
            Backend::Tron => TRON_BLOCK_READ_INTERVAL_MS,
            _ => DEFAULT_BLOCK_READ_INTERVAL_MS,
        };
        Duration::from_millis(self.block_read_interval_ms.unwrap_or(default_ms))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// The configuration block for the selected backend, with its URI
    /// requirement enforced.
    pub fn backend(&self, backend: Backend) -> Result<&BackendConfig, ConfigError> {
        let entry = self
            .backends
            .get(backend.as_str())
            .ok_or_else(|| ConfigError::MissingBackend(backend.as_str().to_string()))?;
        if entry.uri.trim().is_empty() {
            return Err(ConfigError::MissingField {
                backend: backend.as_str().to_string(),
                field: "uri".to_string(),
            });
        }
        Ok(entry)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}
