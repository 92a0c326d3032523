//! # Centralized Error Handling
//!
//! Hierarchical, typed errors for the whole gateway. Client-facing protocol
//! errors keep stable human-readable messages (they cross the wire); upstream
//! failures stay internal and are logged at the call site.

use thiserror::Error;

/// The top-level error type for the gateway binary.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Subscription error: {0}")]
    Subscribe(#[from] SubscribeError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("System shut down")]
    Shutdown,
}

/// Failures loading or validating `config.json`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("backend '{0}' is not configured")]
    MissingBackend(String),
    #[error("backend '{backend}' is missing required field '{field}'")]
    MissingField { backend: String, field: String },
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

/// Upstream-facing failures surfaced by chain adapters. Soft by design:
/// the poller logs and moves on, subscribers reconcile via history queries.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("upstream rpc error: {0}")]
    Rpc(String),
    #[error("malformed upstream data: {0}")]
    Decode(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(e.to_string())
        } else {
            AdapterError::UpstreamUnavailable(e.to_string())
        }
    }
}

/// Client-side protocol failures on the subscribe path. The messages are
/// wire-visible; connection state is never changed by these.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("address {0} is already subscribed")]
    AlreadySubscribed(String),
    #[error("{0} is not an account")]
    NotAnAccount(String),
    #[error("{0} is not a contract")]
    NotAContract(String),
    #[error("subscription capacity exceeded")]
    CapacityExceeded,
    #[error("bad request format")]
    BadRequest,
    #[error("missing address parameter")]
    MissingAddress,
}

/// Non-blocking delivery failures. Logged, never retried.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery channel full")]
    ChannelFull,
    #[error("connection closed")]
    Closed,
}
