//! # Chain Adapters
//!
//! The pluggable capability set every upstream backend satisfies, plus the
//! four concrete satisfiers. The generic poller and the matcher only ever
//! see this trait and [`NormalizedTx`]; everything chain-specific (address
//! forms, log decoding, upstream quirks) stays behind it.

use crate::errors::AdapterError;
use crate::types::{ChainKind, HistoryQuery, NormalizedTx};
use async_trait::async_trait;
use std::time::Duration;

pub mod evm;
pub mod solana;
pub mod ton;
pub mod tron;

pub use evm::EvmAdapter;
pub use solana::SolanaAdapter;
pub use ton::TonAdapter;
pub use tron::TronAdapter;

/// Capability contract between one upstream chain and the gateway core.
///
/// Implementations are cheap to clone behind `Arc` and safe to call from
/// multiple tasks. All network calls are suspension points and carry the
/// configured upstream timeout.
#[async_trait]
pub trait ChainAdapter: Send + Sync + std::fmt::Debug {
    fn chain(&self) -> ChainKind;

    /// Height poll cadence, from `block_read_interval_ms`.
    fn poll_interval(&self) -> Duration;

    /// Backends fed from an external live stream do not index by height;
    /// the poller returns immediately for them.
    fn height_polling_disabled(&self) -> bool {
        false
    }

    /// Current best known height (slot for Solana).
    async fn height(&self) -> Result<u64, AdapterError>;

    /// All relevant transactions at `height`, already normalized. A partial
    /// failure (one tx lookup of many) must not fail the whole call: failed
    /// items are dropped and logged.
    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError>;

    /// Installs whatever upstream filter is needed to observe token
    /// transfer events for `token`. Idempotent; a no-op for chains that
    /// harvest logs inline from block fetch.
    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError>;

    /// `true` for a plain externally-owned account, `false` for a contract.
    /// Chains without code-at-address semantics answer syntactically.
    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError>;

    /// Canonical form used for all matching and wire output.
    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError>;

    /// Addresses the matcher compares against in addition to the raw
    /// subscribed address. The default is just the address itself; Solana
    /// adds derived associated token accounts.
    fn match_aliases(&self, addr: &str, _tokens: &[String]) -> Vec<String> {
        vec![addr.to_string()]
    }

    /// Historical query backing `getTransactionsByAddress`.
    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError>;

    /// Jetton transfer history (`getTokenTransfers`). TON only.
    async fn token_transfers(
        &self,
        _address: &str,
        _token: &str,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        Err(AdapterError::Unsupported)
    }
}

/// Shared HTTP client with the gateway's upstream timeout applied.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
}

/// Default page size for historical queries when the client sends none.
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 100;
