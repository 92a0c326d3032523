//! TON adapter over a toncenter-style v3 indexer.
//!
//! Only deposits are reported: a transaction with a non-empty outgoing
//! message list is skipped. Jetton transfers for watched masters are
//! harvested once per height cycle behind a logical-time cursor, so no
//! per-contract timers exist to leak. Paginated calls use `limit=200` and
//! stop after 250 pages. Timestamps are upstream unix seconds; hashes are
//! normalized from base64url to base64.

use crate::adapters::{http_client, ChainAdapter, DEFAULT_PAGE_SIZE};
use crate::config::BackendConfig;
use crate::errors::AdapterError;
use crate::rate_limiter::UpstreamLimiter;
use crate::types::{Backend, ChainKind, HistoryQuery, NormalizedTx};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use dashmap::DashMap;
use ethers::types::U256;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_LIMIT: u32 = 200;
/// 250 pages x 200 records = 50 000 records per call, hard stop.
const MAX_PAGES: u32 = 250;

const BOUNCEABLE_TAG: u8 = 0x11;
const NON_BOUNCEABLE_TAG: u8 = 0x51;
const TESTNET_FLAG: u8 = 0x80;

//================================================================================================//
//                                     ADDRESS CODEC                                              //
//================================================================================================//

/// CRC-16/XMODEM, as used by the friendly address format.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn parse_raw(addr: &str) -> Option<(i8, [u8; 32])> {
    let (wc, hash) = addr.split_once(':')?;
    let wc: i8 = wc.parse().ok()?;
    let bytes = hex::decode(hash).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some((wc, out))
}

fn decode_friendly(addr: &str) -> Option<(u8, i8, [u8; 32])> {
    let data = URL_SAFE_NO_PAD
        .decode(addr)
        .or_else(|_| STANDARD.decode(addr))
        .ok()?;
    if data.len() != 36 {
        return None;
    }
    let crc = crc16(&data[..34]);
    if crc.to_be_bytes() != data[34..36] {
        return None;
    }
    let tag = data[0] & !TESTNET_FLAG;
    if tag != BOUNCEABLE_TAG && tag != NON_BOUNCEABLE_TAG {
        return None;
    }
    let wc = data[1] as i8;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&data[2..34]);
    Some((tag, wc, hash))
}

fn encode_friendly(tag: u8, wc: i8, hash: &[u8; 32]) -> String {
    let mut data = Vec::with_capacity(36);
    data.push(tag);
    data.push(wc as u8);
    data.extend_from_slice(hash);
    let crc = crc16(&data);
    data.extend_from_slice(&crc.to_be_bytes());
    URL_SAFE_NO_PAD.encode(data)
}

/// Canonical form: non-bounceable url-safe friendly encoding. Accepts raw
/// (`0:hex`) and friendly (either bounceable flag) inputs; matching is
/// therefore bounceable-flag-insensitive.
pub(crate) fn canonical_address(addr: &str) -> Result<String, AdapterError> {
    let trimmed = addr.trim();
    if let Some((wc, hash)) = parse_raw(trimmed) {
        return Ok(encode_friendly(NON_BOUNCEABLE_TAG, wc, &hash));
    }
    if let Some((_tag, wc, hash)) = decode_friendly(trimmed) {
        return Ok(encode_friendly(NON_BOUNCEABLE_TAG, wc, &hash));
    }
    Err(AdapterError::InvalidAddress(addr.to_string()))
}

/// Indexer hashes may arrive base64url-encoded; the canonical form is
/// plain base64.
pub(crate) fn canonical_hash(hash: &str) -> String {
    hash.replace('-', "+").replace('_', "/")
}

fn parse_amount(v: &Value) -> Option<U256> {
    match v {
        Value::String(s) => U256::from_dec_str(s).ok(),
        Value::Number(n) => n.as_u64().map(U256::from),
        _ => None,
    }
}

//================================================================================================//
//                                     UPSTREAM SHAPES                                            //
//================================================================================================//

#[derive(Debug, Deserialize)]
struct McInfo {
    last: McBlock,
}

#[derive(Debug, Deserialize)]
struct McBlock {
    seqno: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TxPage {
    #[serde(default)]
    transactions: Vec<TonTx>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TonTx {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    account: String,
    /// Unix seconds.
    #[serde(default)]
    now: Option<u64>,
    #[serde(default)]
    in_msg: Option<TonMsg>,
    #[serde(default)]
    out_msgs: Vec<Value>,
    #[serde(default)]
    mc_block_seqno: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TonMsg {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct JettonPage {
    #[serde(default)]
    jetton_transfers: Vec<JettonTransfer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct JettonTransfer {
    #[serde(default)]
    transaction_hash: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    jetton_master: String,
    #[serde(default)]
    transaction_lt: Option<String>,
    #[serde(default)]
    transaction_now: Option<u64>,
}

/// Normalizes one indexer transaction into a deposit record. Returns `None`
/// for anything that is not a plain inbound value transfer.
pub(crate) fn deposit_from_tx(tx: &TonTx, height: u64) -> Option<NormalizedTx> {
    // Outgoing messages mean the account acted, not merely received.
    if !tx.out_msgs.is_empty() {
        return None;
    }
    let in_msg = tx.in_msg.as_ref()?;
    let value = in_msg.value.as_ref().and_then(parse_amount)?;
    if value.is_zero() {
        return None;
    }
    let to = canonical_address(&tx.account).ok()?;
    let from = in_msg
        .source
        .as_deref()
        .and_then(|s| canonical_address(s).ok());
    Some(NormalizedTx {
        hash: canonical_hash(&tx.hash),
        from,
        to,
        value,
        block_number: tx.mc_block_seqno.unwrap_or(height),
        timestamp: tx.now,
        token: None,
        symbol: None,
        fee: None,
        receipt: None,
    })
}

fn jetton_to_normalized(item: &JettonTransfer, height: u64) -> Option<NormalizedTx> {
    let value = item.amount.as_ref().and_then(parse_amount)?;
    if value.is_zero() {
        return None;
    }
    let from = canonical_address(item.source.as_deref()?).ok()?;
    let to = canonical_address(item.destination.as_deref()?).ok()?;
    let token = canonical_address(&item.jetton_master).ok()?;
    Some(NormalizedTx {
        hash: canonical_hash(&item.transaction_hash),
        from: Some(from),
        to,
        value,
        block_number: height,
        timestamp: item.transaction_now,
        token: Some(token),
        symbol: None,
        fee: None,
        receipt: None,
    })
}

fn lt_of(item: &JettonTransfer) -> u64 {
    item.transaction_lt
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

//================================================================================================//
//                                        ADAPTER                                                 //
//================================================================================================//

#[derive(Debug, Clone)]
pub struct TonAdapter {
    base_uri: String,
    api_key: Option<String>,
    client: reqwest::Client,
    interval: Duration,
    limiter: Arc<UpstreamLimiter>,
    /// Watched jetton master -> logical-time cursor of the newest transfer
    /// already reported.
    watched_jettons: Arc<DashMap<String, u64>>,
}

impl TonAdapter {
    pub fn new(
        cfg: &BackendConfig,
        limiter: Arc<UpstreamLimiter>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            base_uri: cfg.uri.trim_end_matches('/').to_string(),
            api_key: cfg.api_key(),
            client: http_client(timeout)?,
            interval: cfg.block_read_interval(Backend::Toncenter),
            limiter,
            watched_jettons: Arc::new(DashMap::new()),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Result<T, AdapterError> {
        let url = format!("{}/{}", self.base_uri, path);
        let mut req = self.client.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
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

    async fn block_transactions(&self, height: u64) -> Result<Vec<TonTx>, AdapterError> {
        let mut all = Vec::new();
        for page in 0..MAX_PAGES {
            let offset = page * PAGE_LIMIT;
            let page_txs: TxPage = self
                .limiter
                .execute("transactionsByMasterchainBlock", || {
                    self.get(
                        "api/v3/transactionsByMasterchainBlock",
                        vec![
                            ("seqno", height.to_string()),
                            ("limit", PAGE_LIMIT.to_string()),
                            ("offset", offset.to_string()),
                        ],
                    )
                })
                .await?;
            let count = page_txs.transactions.len();
            all.extend(page_txs.transactions);
            if count < PAGE_LIMIT as usize {
                return Ok(all);
            }
        }
        warn!(target: "adapter::ton", height, pages = MAX_PAGES, "pagination cap reached");
        Ok(all)
    }

    async fn jetton_transfers_page(
        &self,
        master: &str,
        owner: Option<&str>,
        offset: u32,
    ) -> Result<Vec<JettonTransfer>, AdapterError> {
        let mut query = vec![
            ("jetton_master", master.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some(owner) = owner {
            query.push(("owner_address", owner.to_string()));
        }
        let page: JettonPage = self
            .limiter
            .execute("jetton/transfers", || self.get("api/v3/jetton/transfers", query))
            .await?;
        Ok(page.jetton_transfers)
    }

    /// New transfers for one watched master, in ascending logical-time
    /// order, stamped with the observing height.
    async fn drain_jetton_master(&self, master: &str, height: u64) -> Vec<NormalizedTx> {
        let cursor = self.watched_jettons.get(master).map(|e| *e.value()).unwrap_or(0);
        let page = match self.jetton_transfers_page(master, None, 0).await {
            Ok(page) => page,
            Err(e) => {
                warn!(target: "adapter::ton", master, error = %e, "jetton transfer fetch failed");
                return Vec::new();
            }
        };
        let mut fresh: Vec<&JettonTransfer> =
            page.iter().filter(|item| lt_of(item) > cursor).collect();
        fresh.sort_by_key(|item| lt_of(item));
        let mut out = Vec::new();
        let mut max_lt = cursor;
        for item in fresh {
            max_lt = max_lt.max(lt_of(item));
            if let Some(tx) = jetton_to_normalized(item, height) {
                out.push(tx);
            }
        }
        if max_lt > cursor {
            self.watched_jettons.insert(master.to_string(), max_lt);
        }
        out
    }
}

#[async_trait]
impl ChainAdapter for TonAdapter {
    fn chain(&self) -> ChainKind {
        ChainKind::Ton
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn height(&self) -> Result<u64, AdapterError> {
        let info: McInfo = self
            .limiter
            .execute("masterchainInfo", || self.get("api/v3/masterchainInfo", Vec::new()))
            .await?;
        Ok(info.last.seqno)
    }

    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError> {
        let mut txs: Vec<NormalizedTx> = self
            .block_transactions(height)
            .await?
            .iter()
            .filter_map(|tx| deposit_from_tx(tx, height))
            .collect();

        let masters: Vec<String> = self.watched_jettons.iter().map(|e| e.key().clone()).collect();
        for master in masters {
            txs.extend(self.drain_jetton_master(&master, height).await);
        }
        Ok(txs)
    }

    /// Seeds the logical-time cursor so a fresh watch does not replay
    /// history. Idempotent.
    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError> {
        let master = canonical_address(token)?;
        if self.watched_jettons.contains_key(&master) {
            return Ok(());
        }
        let initial_lt = match self.jetton_transfers_page(&master, None, 0).await {
            Ok(page) => page.iter().map(lt_of).max().unwrap_or(0),
            Err(e) => {
                warn!(target: "adapter::ton", master = %master, error = %e, "cursor seed failed, starting from zero");
                0
            }
        };
        self.watched_jettons.insert(master.clone(), initial_lt);
        debug!(target: "adapter::ton", master = %master, initial_lt, "watching jetton master");
        Ok(())
    }

    /// TON has no code-at-address probe here; validity is syntactic.
    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError> {
        Ok(canonical_address(addr).is_ok())
    }

    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError> {
        canonical_address(addr)
    }

    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let account = canonical_address(&query.address)?;
        let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;
        let mut out = Vec::new();

        for page in 0..MAX_PAGES {
            let offset = page * PAGE_LIMIT;
            let page_txs: TxPage = self
                .limiter
                .execute("transactions", || {
                    self.get(
                        "api/v3/transactions",
                        vec![
                            ("account", account.clone()),
                            ("limit", PAGE_LIMIT.to_string()),
                            ("offset", offset.to_string()),
                            ("sort", "desc".to_string()),
                        ],
                    )
                })
                .await?;
            let count = page_txs.transactions.len();
            for tx in &page_txs.transactions {
                let height = tx.mc_block_seqno.unwrap_or(0);
                if let Some(from) = query.from_block {
                    if height < from {
                        continue;
                    }
                }
                if let Some(to) = query.to_block {
                    if height > to {
                        continue;
                    }
                }
                if let Some(normalized) = deposit_from_tx(tx, height) {
                    out.push(normalized);
                    if out.len() >= page_size {
                        return Ok(out);
                    }
                }
            }
            if count < PAGE_LIMIT as usize {
                break;
            }
        }
        Ok(out)
    }

    async fn token_transfers(
        &self,
        address: &str,
        token: &str,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let owner = canonical_address(address)?;
        let master = canonical_address(token)?;
        let mut out = Vec::new();

        for page in 0..MAX_PAGES {
            let offset = page * PAGE_LIMIT;
            let items = self
                .jetton_transfers_page(&master, Some(&owner), offset)
                .await?;
            let count = items.len();
            for item in &items {
                if let Some(tx) = jetton_to_normalized(item, 0) {
                    out.push(tx);
                }
            }
            if count < PAGE_LIMIT as usize {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RAW: &str = "0:3333333333333333333333333333333333333333333333333333333333333333";

    #[test]
    fn canonicalization_is_idempotent_and_flag_insensitive() {
        let canon = canonical_address(RAW).unwrap();
        assert_eq!(canonical_address(&canon).unwrap(), canon);

        // Re-encode the same account bounceable; it must normalize equal.
        let (_, wc, hash) = decode_friendly(&canon).unwrap();
        let bounceable = encode_friendly(BOUNCEABLE_TAG, wc, &hash);
        assert_ne!(bounceable, canon);
        assert_eq!(canonical_address(&bounceable).unwrap(), canon);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let canon = canonical_address(RAW).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&canon).unwrap();
        bytes[35] ^= 0xff;
        let bad = URL_SAFE_NO_PAD.encode(bytes);
        assert!(canonical_address(&bad).is_err());
    }

    #[test]
    fn base64url_hashes_normalize_to_base64() {
        assert_eq!(canonical_hash("ab-_cd"), "ab+/cd");
    }

    #[test]
    fn outgoing_messages_mean_no_deposit() {
        let tx: TonTx = serde_json::from_value(json!({
            "hash": "aGFzaA==",
            "account": RAW,
            "now": 1_700_000_000u64,
            "in_msg": { "source": RAW, "value": "700000000" },
            "out_msgs": [ { "destination": RAW } ]
        }))
        .unwrap();
        assert!(deposit_from_tx(&tx, 100).is_none());
    }

    #[test]
    fn inbound_value_becomes_deposit() {
        let tx: TonTx = serde_json::from_value(json!({
            "hash": "aGFz-_==",
            "account": RAW,
            "now": 1_700_000_000u64,
            "in_msg": { "source": null, "value": "700000000" },
            "out_msgs": []
        }))
        .unwrap();
        let out = deposit_from_tx(&tx, 100).unwrap();
        assert_eq!(out.value, U256::from(700_000_000u64));
        assert_eq!(out.block_number, 100);
        assert!(out.from.is_none());
        assert_eq!(out.to, canonical_address(RAW).unwrap());
        assert_eq!(out.hash, "aGFz+/==");
    }

    #[test]
    fn zero_value_deposits_are_dropped() {
        let tx: TonTx = serde_json::from_value(json!({
            "hash": "aGFzaA==",
            "account": RAW,
            "in_msg": { "source": RAW, "value": "0" },
            "out_msgs": []
        }))
        .unwrap();
        assert!(deposit_from_tx(&tx, 1).is_none());
    }
}
