//! chaingate: a uniform JSON-RPC + WebSocket façade over heterogeneous
//! chain indexers. One backend per process; live `subscribeAccount` events
//! are discovered by a per-chain height poller and matched against an
//! in-memory interest index.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod matcher;
pub mod metrics;
pub mod poller;
pub mod rate_limiter;
pub mod server;
pub mod subscriptions;
pub mod types;
