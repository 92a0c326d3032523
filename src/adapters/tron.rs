//! Tron adapter over the full/solidity node HTTP API.
//!
//! Only `TransferContract` (native TRX) and `TriggerSmartContract` (TRC20)
//! entries whose `ret[0].contractRet` is `SUCCESS` are considered. A smart
//! contract transfer is accepted only after its transaction info confirms
//! `receipt.result == "SUCCESS"` with exactly one `Transfer` log. Block and
//! transaction-info responses sit behind 10 s TTL caches so back-to-back
//! polls never re-query the node. Timestamps are upstream milliseconds.

use crate::adapters::{http_client, ChainAdapter, DEFAULT_PAGE_SIZE};
use crate::config::BackendConfig;
use crate::errors::AdapterError;
use crate::rate_limiter::UpstreamLimiter;
use crate::types::{Backend, ChainKind, HistoryQuery, NormalizedTx};
use async_trait::async_trait;
use ethers::types::U256;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// keccak256("Transfer(address,address,uint256)"), as Tron logs carry it.
const TRANSFER_TOPIC: &str = "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// TRC20 `transfer(address,uint256)` selector.
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

const CACHE_TTL: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: u64 = 512;
const MAX_HISTORY_SCAN_BLOCKS: u64 = 200;

//================================================================================================//
//                                     UPSTREAM SHAPES                                            //
//================================================================================================//

#[derive(Debug, Clone, Default, Deserialize)]
struct TronBlock {
    #[serde(default)]
    block_header: Option<BlockHeader>,
    #[serde(default)]
    transactions: Vec<TronTx>,
}

#[derive(Debug, Clone, Deserialize)]
struct BlockHeader {
    raw_data: BlockRaw,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BlockRaw {
    #[serde(default)]
    number: u64,
    /// Milliseconds.
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TronTx {
    #[serde(rename = "txID", default)]
    tx_id: String,
    #[serde(default)]
    ret: Vec<TxRet>,
    #[serde(default)]
    raw_data: TxRaw,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxRet {
    #[serde(rename = "contractRet", default)]
    contract_ret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxRaw {
    #[serde(default)]
    contract: Vec<TxContract>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxContract {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    parameter: TxParameter,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxParameter {
    #[serde(default)]
    value: ContractValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ContractValue {
    #[serde(default)]
    owner_address: String,
    #[serde(default)]
    to_address: String,
    #[serde(default)]
    amount: u64,
    #[serde(default)]
    contract_address: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TxInfo {
    #[serde(default)]
    fee: u64,
    #[serde(default)]
    receipt: Value,
    #[serde(default)]
    log: Vec<TxLog>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxLog {
    #[serde(default)]
    topics: Vec<String>,
}

//================================================================================================//
//                                    ADDRESS CODEC                                               //
//================================================================================================//

/// Encodes a 21-byte `41`-prefixed hex address to base58check (`T…`).
pub(crate) fn b58_from_hex(hex_addr: &str) -> Result<String, AdapterError> {
    let bytes = hex::decode(hex_addr.trim_start_matches("0x"))
        .map_err(|_| AdapterError::InvalidAddress(hex_addr.to_string()))?;
    if bytes.len() != 21 || bytes[0] != 0x41 {
        return Err(AdapterError::InvalidAddress(hex_addr.to_string()));
    }
    let check = Sha256::digest(Sha256::digest(&bytes));
    let mut full = bytes;
    full.extend_from_slice(&check[..4]);
    Ok(bs58::encode(full).into_string())
}

/// Decodes a base58check address back to its `41…` hex payload, verifying
/// the checksum.
pub(crate) fn b58_to_hex(addr: &str) -> Result<String, AdapterError> {
    let data = bs58::decode(addr)
        .into_vec()
        .map_err(|_| AdapterError::InvalidAddress(addr.to_string()))?;
    if data.len() != 25 {
        return Err(AdapterError::InvalidAddress(addr.to_string()));
    }
    let (payload, checksum) = data.split_at(21);
    let check = Sha256::digest(Sha256::digest(payload));
    if checksum != &check[..4] || payload[0] != 0x41 {
        return Err(AdapterError::InvalidAddress(addr.to_string()));
    }
    Ok(hex::encode(payload))
}

/// Canonical base58check form from either accepted input form.
pub(crate) fn canonical_address(addr: &str) -> Result<String, AdapterError> {
    let trimmed = addr.trim();
    if trimmed.len() == 42 && trimmed.to_lowercase().starts_with("41") {
        return b58_from_hex(trimmed);
    }
    b58_to_hex(trimmed)?;
    Ok(trimmed.to_string())
}

/// Splits TRC20 `transfer(address,uint256)` call data into the recipient's
/// `41…` hex form and the big-endian amount word.
fn parse_transfer_call(data: &str) -> Option<(String, U256)> {
    let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
    if bytes.len() < 68 || bytes[0..4] != TRANSFER_SELECTOR {
        return None;
    }
    let mut to = vec![0x41u8];
    to.extend_from_slice(&bytes[16..36]);
    let value = U256::from_big_endian(&bytes[36..68]);
    Some((hex::encode(to), value))
}

/// Builds a normalized TRC20 transfer once block entry and transaction info
/// are both in hand. Pure; returns `Ok(None)` for entries that fail any of
/// the acceptance checks.
pub(crate) fn token_transfer_from_parts(
    tx: &TronTx,
    value: &ContractValue,
    info: &TxInfo,
    height: u64,
    timestamp: Option<u64>,
) -> Result<Option<NormalizedTx>, AdapterError> {
    let Some((to_hex, amount)) = parse_transfer_call(&value.data) else {
        return Ok(None);
    };
    if info.receipt.get("result").and_then(Value::as_str) != Some("SUCCESS") {
        return Ok(None);
    }
    if info.log.len() != 1 {
        return Ok(None);
    }
    let topic0 = info.log[0]
        .topics
        .first()
        .map(|t| t.trim_start_matches("0x").to_lowercase());
    if topic0.as_deref() != Some(TRANSFER_TOPIC) {
        return Ok(None);
    }
    Ok(Some(NormalizedTx {
        hash: tx.tx_id.to_lowercase(),
        from: Some(b58_from_hex(&value.owner_address)?),
        to: b58_from_hex(&to_hex)?,
        value: amount,
        block_number: height,
        timestamp,
        token: Some(b58_from_hex(&value.contract_address)?),
        symbol: None,
        fee: Some(U256::from(info.fee)),
        receipt: Some(info.receipt.clone()),
    }))
}

//================================================================================================//
//                                        ADAPTER                                                 //
//================================================================================================//

#[derive(Debug, Clone)]
pub struct TronAdapter {
    full_uri: String,
    solidity_uri: String,
    api_key: Option<String>,
    client: reqwest::Client,
    interval: Duration,
    limiter: Arc<UpstreamLimiter>,
    block_cache: Cache<u64, Arc<TronBlock>>,
    txinfo_cache: Cache<String, Arc<TxInfo>>,
}

impl TronAdapter {
    pub fn new(
        cfg: &BackendConfig,
        limiter: Arc<UpstreamLimiter>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            full_uri: cfg.uri.trim_end_matches('/').to_string(),
            solidity_uri: cfg
                .solidity_uri
                .as_deref()
                .unwrap_or(&cfg.uri)
                .trim_end_matches('/')
                .to_string(),
            api_key: cfg.api_key(),
            client: http_client(timeout)?,
            interval: cfg.block_read_interval(Backend::Tron),
            limiter,
            block_cache: Cache::builder()
                .time_to_live(CACHE_TTL)
                .max_capacity(CACHE_CAPACITY)
                .build(),
            txinfo_cache: Cache::builder()
                .time_to_live(CACHE_TTL)
                .max_capacity(CACHE_CAPACITY)
                .build(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        body: Value,
    ) -> Result<T, AdapterError> {
        let url = format!("{}/{}", base, path);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("TRON-PRO-API-KEY", key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::UpstreamUnavailable(format!(
                "{} returned {}",
                path,
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))
    }

    async fn block_by_num(&self, height: u64) -> Result<Arc<TronBlock>, AdapterError> {
        if let Some(block) = self.block_cache.get(&height).await {
            return Ok(block);
        }
        let block: TronBlock = self
            .limiter
            .execute("getblockbynum", || {
                self.post(&self.full_uri, "wallet/getblockbynum", json!({ "num": height }))
            })
            .await?;
        let block = Arc::new(block);
        self.block_cache.insert(height, block.clone()).await;
        Ok(block)
    }

    async fn tx_info(&self, txid: &str) -> Result<Arc<TxInfo>, AdapterError> {
        if let Some(info) = self.txinfo_cache.get(txid).await {
            return Ok(info);
        }
        let info: TxInfo = self
            .limiter
            .execute("gettransactioninfobyid", || {
                self.post(
                    &self.solidity_uri,
                    "walletsolidity/gettransactioninfobyid",
                    json!({ "value": txid }),
                )
            })
            .await?;
        let info = Arc::new(info);
        self.txinfo_cache.insert(txid.to_string(), info.clone()).await;
        Ok(info)
    }
}

#[async_trait]
impl ChainAdapter for TronAdapter {
    fn chain(&self) -> ChainKind {
        ChainKind::Tron
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn height(&self) -> Result<u64, AdapterError> {
        let block: TronBlock = self
            .limiter
            .execute("getnowblock", || {
                self.post(&self.full_uri, "wallet/getnowblock", json!({}))
            })
            .await?;
        block
            .block_header
            .map(|h| h.raw_data.number)
            .ok_or_else(|| AdapterError::Decode("getnowblock without header".to_string()))
    }

    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError> {
        let block = self.block_by_num(height).await?;
        let timestamp = block.block_header.as_ref().map(|h| h.raw_data.timestamp);
        let mut txs = Vec::new();

        for tx in &block.transactions {
            if tx.ret.first().map(|r| r.contract_ret.as_str()) != Some("SUCCESS") {
                continue;
            }
            let Some(contract) = tx.raw_data.contract.first() else {
                continue;
            };
            let value = &contract.parameter.value;
            match contract.kind.as_str() {
                "TransferContract" => {
                    let (Ok(from), Ok(to)) = (
                        b58_from_hex(&value.owner_address),
                        b58_from_hex(&value.to_address),
                    ) else {
                        warn!(target: "adapter::tron", txid = %tx.tx_id, "skipping transfer with bad addresses");
                        continue;
                    };
                    txs.push(NormalizedTx {
                        hash: tx.tx_id.to_lowercase(),
                        from: Some(from),
                        to,
                        value: U256::from(value.amount),
                        block_number: height,
                        timestamp,
                        token: None,
                        symbol: None,
                        fee: None,
                        receipt: None,
                    });
                }
                "TriggerSmartContract" => {
                    // The info lookup is a partial-failure boundary: one bad
                    // lookup drops one candidate, never the whole height.
                    let info = match self.tx_info(&tx.tx_id).await {
                        Ok(info) => info,
                        Err(e) => {
                            warn!(target: "adapter::tron", txid = %tx.tx_id, error = %e, "tx info lookup failed, dropping candidate");
                            continue;
                        }
                    };
                    match token_transfer_from_parts(tx, value, &info, height, timestamp) {
                        Ok(Some(transfer)) => txs.push(transfer),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(target: "adapter::tron", txid = %tx.tx_id, error = %e, "dropping malformed token transfer");
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(txs)
    }

    /// Tron harvests TRC20 logs inline from block fetch; there is no
    /// upstream filter to install.
    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError> {
        let token = canonical_address(token)?;
        debug!(target: "adapter::tron", token, "contract interest recorded (inline harvest)");
        Ok(())
    }

    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError> {
        let hex_addr = b58_to_hex(&canonical_address(addr)?)?;
        let contract: Value = self
            .limiter
            .execute("getcontract", || {
                self.post(&self.full_uri, "wallet/getcontract", json!({ "value": hex_addr }))
            })
            .await?;
        let is_contract = contract.get("bytecode").and_then(Value::as_str).map_or(false, |b| !b.is_empty())
            || contract.get("abi").is_some();
        Ok(!is_contract)
    }

    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError> {
        canonical_address(addr)
    }

    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let address = canonical_address(&query.address)?;
        let token = query
            .token_address
            .as_deref()
            .map(canonical_address)
            .transpose()?;
        let tip = self.height().await?;
        let to_block = query.to_block.unwrap_or(tip).min(tip);
        let from_block = query
            .from_block
            .unwrap_or_else(|| to_block.saturating_sub(MAX_HISTORY_SCAN_BLOCKS))
            .max(to_block.saturating_sub(MAX_HISTORY_SCAN_BLOCKS));
        let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;

        let mut out = Vec::new();
        for height in from_block..=to_block {
            let txs = match self.txs_at(height).await {
                Ok(txs) => txs,
                Err(e) => {
                    warn!(target: "adapter::tron", height, error = %e, "history scan skipped height");
                    continue;
                }
            };
            for tx in txs {
                if tx.from.as_deref() != Some(address.as_str()) && tx.to != address {
                    continue;
                }
                if let Some(token) = &token {
                    if tx.token.as_deref() != Some(token.as_str()) {
                        continue;
                    }
                }
                out.push(tx);
                if out.len() >= page_size {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_hex(seed: u8) -> String {
        let mut bytes = vec![0x41u8];
        bytes.extend_from_slice(&[seed; 20]);
        hex::encode(bytes)
    }

    #[test]
    fn base58check_round_trip() {
        let hex_addr = addr_hex(0x7f);
        let b58 = b58_from_hex(&hex_addr).unwrap();
        assert!(b58.starts_with('T'));
        assert_eq!(b58_to_hex(&b58).unwrap(), hex_addr);
        // Canonicalization is idempotent.
        assert_eq!(canonical_address(&b58).unwrap(), b58);
        assert_eq!(canonical_address(&hex_addr).unwrap(), b58);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let hex_addr = addr_hex(0x11);
        let b58 = b58_from_hex(&hex_addr).unwrap();
        let mut corrupted = b58.into_bytes();
        let last = corrupted.last_mut().unwrap();
        *last = if *last == b'1' { b'2' } else { b'1' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(b58_to_hex(&corrupted).is_err());
    }

    fn trigger_fixture(owner_hex: &str, token_hex: &str, to_hex: &str, amount: u64) -> (TronTx, TxInfo) {
        let mut data = hex::encode(TRANSFER_SELECTOR);
        // 32-byte recipient word: 12 zero bytes then the 20-byte body.
        data.push_str(&"00".repeat(12));
        data.push_str(&to_hex[2..]);
        let mut amount_word = [0u8; 32];
        U256::from(amount).to_big_endian(&mut amount_word);
        data.push_str(&hex::encode(amount_word));

        let tx: TronTx = serde_json::from_value(json!({
            "txID": "14f76e1f289e2c5ce84c2f9e0a2b1d3c4e5f60718293a4b5c6d7e8f90a1bdd10",
            "ret": [{ "contractRet": "SUCCESS" }],
            "raw_data": {
                "contract": [{
                    "type": "TriggerSmartContract",
                    "parameter": { "value": {
                        "owner_address": owner_hex,
                        "contract_address": token_hex,
                        "data": data,
                    }}
                }]
            }
        }))
        .unwrap();

        let info: TxInfo = serde_json::from_value(json!({
            "fee": 13_844_850u64,
            "receipt": { "result": "SUCCESS" },
            "log": [{ "topics": [TRANSFER_TOPIC] }]
        }))
        .unwrap();
        (tx, info)
    }

    #[test]
    fn confirmed_trc20_transfer_is_normalized() {
        let owner_hex = addr_hex(0x01);
        let token_hex = addr_hex(0x02);
        let to_hex = addr_hex(0x03);
        let (tx, info) = trigger_fixture(&owner_hex, &token_hex, &to_hex, 5_000_000);

        let value = &tx.raw_data.contract[0].parameter.value;
        let out = token_transfer_from_parts(&tx, value, &info, 65_475_881, Some(1_700_000_000_000))
            .unwrap()
            .unwrap();

        assert_eq!(out.value, U256::from(5_000_000u64));
        assert_eq!(out.fee, Some(U256::from(13_844_850u64)));
        assert_eq!(out.block_number, 65_475_881);
        assert_eq!(
            out.hash,
            "14f76e1f289e2c5ce84c2f9e0a2b1d3c4e5f60718293a4b5c6d7e8f90a1bdd10"
        );
        assert_eq!(out.from.as_deref(), Some(b58_from_hex(&owner_hex).unwrap().as_str()));
        assert_eq!(out.to, b58_from_hex(&to_hex).unwrap());
        assert_eq!(out.token.as_deref(), Some(b58_from_hex(&token_hex).unwrap().as_str()));
    }

    #[test]
    fn unconfirmed_or_multi_log_transfers_are_dropped() {
        let owner_hex = addr_hex(0x01);
        let token_hex = addr_hex(0x02);
        let to_hex = addr_hex(0x03);
        let (tx, info) = trigger_fixture(&owner_hex, &token_hex, &to_hex, 1);
        let value = &tx.raw_data.contract[0].parameter.value;

        let mut failed = info.clone();
        failed.receipt = json!({ "result": "REVERT" });
        assert!(token_transfer_from_parts(&tx, value, &failed, 1, None).unwrap().is_none());

        let mut doubled = info.clone();
        let first_log = doubled.log[0].clone();
        doubled.log.push(first_log);
        assert!(token_transfer_from_parts(&tx, value, &doubled, 1, None).unwrap().is_none());

        let mut wrong_topic = info;
        wrong_topic.log[0].topics[0] = "00".repeat(32);
        assert!(token_transfer_from_parts(&tx, value, &wrong_topic, 1, None).unwrap().is_none());
    }

    #[test]
    fn non_transfer_calldata_is_ignored() {
        let owner_hex = addr_hex(0x01);
        let token_hex = addr_hex(0x02);
        let to_hex = addr_hex(0x03);
        let (mut tx, info) = trigger_fixture(&owner_hex, &token_hex, &to_hex, 1);
        tx.raw_data.contract[0].parameter.value.data = "deadbeef".to_string();
        let value = tx.raw_data.contract[0].parameter.value.clone();
        assert!(token_transfer_from_parts(&tx, &value, &info, 1, None).unwrap().is_none());
    }
}
