//! EVM adapter, serving both the local-node (`hardhat`) and remote-provider
//! (`ankr`) backends. Native transfers come from block bodies; token
//! transfers are harvested per height from `eth_getLogs` restricted to the
//! contracts subscribers currently care about.

use crate::adapters::{ChainAdapter, DEFAULT_PAGE_SIZE};
use crate::config::BackendConfig;
use crate::errors::AdapterError;
use crate::rate_limiter::UpstreamLimiter;
use crate::types::{Backend, ChainKind, HistoryQuery, NormalizedTx};
use async_trait::async_trait;
use dashmap::DashSet;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockId, Filter, Log, H256, U256};
use lazy_static::lazy_static;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    /// keccak256("Transfer(address,address,uint256)")
    static ref TRANSFER_TOPIC: H256 = H256::from(ethers::utils::keccak256(
        "Transfer(address,address,uint256)".as_bytes()
    ));
}

/// Upper bound on block-body scans for one historical query.
const MAX_HISTORY_SCAN_BLOCKS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct EvmAdapter {
    backend: Backend,
    provider: Arc<Provider<Http>>,
    interval: Duration,
    limiter: Arc<UpstreamLimiter>,
    /// Token contracts with an installed transfer filter.
    watched_contracts: Arc<DashSet<Address>>,
}

impl EvmAdapter {
    pub fn new(
        backend: Backend,
        cfg: &BackendConfig,
        limiter: Arc<UpstreamLimiter>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let url = match cfg.api_key() {
            Some(key) => format!("{}/{}", cfg.uri.trim_end_matches('/'), key),
            None => cfg.uri.clone(),
        };
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))?;
        let provider = Provider::new(Http::new_with_client(parsed, crate::adapters::http_client(timeout)?));
        Ok(Self {
            backend,
            provider: Arc::new(provider),
            interval: cfg.block_read_interval(backend),
            limiter,
            watched_contracts: Arc::new(DashSet::new()),
        })
    }

    fn parse_address(addr: &str) -> Result<Address, AdapterError> {
        Address::from_str(addr.trim())
            .map_err(|_| AdapterError::InvalidAddress(addr.to_string()))
    }

    fn canonical(addr: &Address) -> String {
        format!("0x{}", hex::encode(addr.as_bytes()))
    }

    fn canonical_hash(hash: &H256) -> String {
        format!("0x{}", hex::encode(hash.as_bytes()))
    }

    /// Decodes one `Transfer(address,address,uint256)` log. Malformed logs
    /// are the caller's cue to skip, not to fail the height.
    fn decode_transfer_log(log: &Log, height: u64, timestamp: Option<u64>) -> Option<NormalizedTx> {
        if log.topics.len() != 3 || log.topics[0] != *TRANSFER_TOPIC {
            warn!(target: "adapter::evm", topics = log.topics.len(), "skipping malformed transfer log");
            return None;
        }
        if log.data.len() != 32 {
            warn!(target: "adapter::evm", data_len = log.data.len(), "skipping transfer log with bad data word");
            return None;
        }
        let from = Address::from_slice(&log.topics[1].as_bytes()[12..]);
        let to = Address::from_slice(&log.topics[2].as_bytes()[12..]);
        let value = U256::from_big_endian(&log.data);
        let hash = log.transaction_hash?;
        Some(NormalizedTx {
            hash: Self::canonical_hash(&hash),
            from: Some(Self::canonical(&from)),
            to: Self::canonical(&to),
            value,
            block_number: height,
            timestamp,
            token: Some(Self::canonical(&log.address)),
            symbol: None,
            fee: None,
            receipt: None,
        })
    }

    async fn transfer_logs_in_range(
        &self,
        contracts: Vec<Address>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, AdapterError> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(contracts)
            .topic0(*TRANSFER_TOPIC);
        let provider = self.provider.clone();
        self.limiter
            .execute("eth_getLogs", || async move {
                provider
                    .get_logs(&filter)
                    .await
                    .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn height(&self) -> Result<u64, AdapterError> {
        let provider = self.provider.clone();
        let number = self
            .limiter
            .execute("eth_blockNumber", || async move {
                provider
                    .get_block_number()
                    .await
                    .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
            })
            .await?;
        Ok(number.as_u64())
    }

    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError> {
        let provider = self.provider.clone();
        let block = self
            .limiter
            .execute("eth_getBlockByNumber", || async move {
                provider
                    .get_block_with_txs(BlockId::from(height))
                    .await
                    .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
            })
            .await?;

        let Some(block) = block else {
            debug!(target: "adapter::evm", backend = %self.backend, height, "block not yet available");
            return Ok(Vec::new());
        };
        let timestamp = Some(block.timestamp.as_u64());

        let mut txs = Vec::new();
        for tx in &block.transactions {
            let Some(to) = tx.to else { continue };
            if tx.value.is_zero() {
                continue;
            }
            txs.push(NormalizedTx {
                hash: Self::canonical_hash(&tx.hash),
                from: Some(Self::canonical(&tx.from)),
                to: Self::canonical(&to),
                value: tx.value,
                block_number: height,
                timestamp,
                token: None,
                symbol: None,
                fee: None,
                receipt: None,
            });
        }

        let contracts: Vec<Address> = self.watched_contracts.iter().map(|a| *a).collect();
        if !contracts.is_empty() {
            match self.transfer_logs_in_range(contracts, height, height).await {
                Ok(logs) => {
                    for log in &logs {
                        if let Some(tx) = Self::decode_transfer_log(log, height, timestamp) {
                            txs.push(tx);
                        }
                    }
                }
                Err(e) => {
                    // One failed log fetch must not drop the native transfers.
                    warn!(target: "adapter::evm", backend = %self.backend, height, error = %e, "transfer log fetch failed");
                }
            }
        }
        Ok(txs)
    }

    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError> {
        let addr = Self::parse_address(token)?;
        if self.watched_contracts.insert(addr) {
            debug!(target: "adapter::evm", backend = %self.backend, token = %Self::canonical(&addr), "installed transfer filter");
        }
        Ok(())
    }

    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError> {
        let address = Self::parse_address(addr)?;
        let provider = self.provider.clone();
        let code = self
            .limiter
            .execute("eth_getCode", || async move {
                provider
                    .get_code(address, None)
                    .await
                    .map_err(|e| AdapterError::UpstreamUnavailable(e.to_string()))
            })
            .await?;
        Ok(code.is_empty())
    }

    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError> {
        Ok(Self::canonical(&Self::parse_address(addr)?))
    }

    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let address = self.normalize_address(&query.address)?;
        let tip = self.height().await?;
        let to_block = query.to_block.unwrap_or(tip).min(tip);
        let from_block = query
            .from_block
            .unwrap_or_else(|| to_block.saturating_sub(MAX_HISTORY_SCAN_BLOCKS))
            .max(to_block.saturating_sub(MAX_HISTORY_SCAN_BLOCKS));
        let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;

        let mut out = Vec::new();

        if let Some(token) = &query.token_address {
            // Token history is a single ranged log query.
            let token_addr = Self::parse_address(token)?;
            let logs = self
                .transfer_logs_in_range(vec![token_addr], from_block, to_block)
                .await?;
            for log in &logs {
                let height = log.block_number.map(|n| n.as_u64()).unwrap_or(from_block);
                if let Some(tx) = Self::decode_transfer_log(log, height, None) {
                    if tx.from.as_deref() == Some(address.as_str()) || tx.to == address {
                        out.push(tx);
                        if out.len() >= page_size {
                            break;
                        }
                    }
                }
            }
            return Ok(out);
        }

        for height in from_block..=to_block {
            let txs = match self.txs_at(height).await {
                Ok(txs) => txs,
                Err(e) => {
                    warn!(target: "adapter::evm", height, error = %e, "history scan skipped height");
                    continue;
                }
            };
            for tx in txs {
                if tx.token.is_none()
                    && (tx.from.as_deref() == Some(address.as_str()) || tx.to == address)
                {
                    out.push(tx);
                    if out.len() >= page_size {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }
}
