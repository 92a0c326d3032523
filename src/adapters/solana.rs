//! Solana adapter over JSON-RPC with `jsonParsed` block encoding.
//!
//! A transaction is rejected outright when `meta.err` is set or
//! `meta.status.Ok` is not null. Native transfers are derived from
//! `postBalances - preBalances`; the sender cannot be recovered from a
//! balance diff, so `from` stays absent. SPL transfers come from token
//! balance pairs keyed by `accountIndex` (with the create-ATA zero
//! pre-balance rule) and from parsed `transferChecked` instructions.
//! Heights are slot numbers; timestamps are `blockTime` unix seconds.

use crate::adapters::{http_client, ChainAdapter, DEFAULT_PAGE_SIZE};
use crate::config::BackendConfig;
use crate::errors::AdapterError;
use crate::rate_limiter::UpstreamLimiter;
use crate::types::{Backend, ChainKind, HistoryQuery, NormalizedTx};
use async_trait::async_trait;
use ethers::types::U256;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref TOKEN_PROGRAM_ID: Pubkey =
        Pubkey::from_str("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA").expect("token program id");
    static ref ATA_PROGRAM_ID: Pubkey =
        Pubkey::from_str("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL").expect("ata program id");
}

/// Upstream error codes for slots that were skipped or purged; an empty
/// height, not a failure.
const SKIPPED_SLOT_CODES: [i64; 2] = [-32007, -32009];

//================================================================================================//
//                                     UPSTREAM SHAPES                                            //
//================================================================================================//

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SolanaBlock {
    #[serde(rename = "blockTime", default)]
    block_time: Option<u64>,
    #[serde(default)]
    transactions: Vec<SolanaTxEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SolanaTxEntry {
    #[serde(default)]
    meta: Option<TxMeta>,
    #[serde(default)]
    transaction: TxBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
    #[serde(rename = "preBalances", default)]
    pre_balances: Vec<u64>,
    #[serde(rename = "postBalances", default)]
    post_balances: Vec<u64>,
    #[serde(rename = "preTokenBalances", default)]
    pre_token_balances: Vec<TokenBalance>,
    #[serde(rename = "postTokenBalances", default)]
    post_token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TokenBalance {
    #[serde(rename = "accountIndex", default)]
    account_index: usize,
    #[serde(default)]
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(rename = "uiTokenAmount", default)]
    ui_token_amount: UiAmount,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UiAmount {
    #[serde(default)]
    amount: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxBody {
    #[serde(default)]
    signatures: Vec<String>,
    #[serde(default)]
    message: TxMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TxMessage {
    #[serde(rename = "accountKeys", default)]
    account_keys: Vec<AccountKey>,
    #[serde(default)]
    instructions: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AccountKey {
    #[serde(default)]
    pubkey: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SignatureInfo {
    #[serde(default)]
    signature: String,
    #[serde(default)]
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
}

//================================================================================================//
//                                       NORMALIZATION                                            //
//================================================================================================//

fn tx_succeeded(meta: &TxMeta) -> bool {
    if meta.err.is_some() && meta.err != Some(Value::Null) {
        return false;
    }
    match &meta.status {
        Some(status) => match status.get("Ok") {
            Some(Value::Null) => true,
            Some(_) => false,
            None => status.get("Err").is_none(),
        },
        None => true,
    }
}

fn amount_u256(raw: &str) -> Option<U256> {
    U256::from_dec_str(raw).ok()
}

/// `true` when the transaction creates an associated token account for
/// `(owner, mint)`, which lets a missing pre-balance count as zero.
fn has_create_ata(instructions: &[Value], owner: &str, mint: &str) -> bool {
    instructions.iter().any(|instr| {
        if instr.get("program").and_then(Value::as_str) != Some("spl-associated-token-account") {
            return false;
        }
        let Some(parsed) = instr.get("parsed") else {
            return false;
        };
        let kind = parsed.get("type").and_then(Value::as_str);
        if kind != Some("create") && kind != Some("createIdempotent") {
            return false;
        }
        let info = parsed.get("info");
        info.and_then(|i| i.get("wallet")).and_then(Value::as_str) == Some(owner)
            && info.and_then(|i| i.get("mint")).and_then(Value::as_str) == Some(mint)
    })
}

/// All normalized transfers contained in one confirmed transaction entry.
pub(crate) fn normalize_entry(entry: &SolanaTxEntry, slot: u64, block_time: Option<u64>) -> Vec<NormalizedTx> {
    let Some(meta) = &entry.meta else {
        return Vec::new();
    };
    if !tx_succeeded(meta) {
        return Vec::new();
    }
    let Some(signature) = entry.transaction.signatures.first() else {
        return Vec::new();
    };
    let keys = &entry.transaction.message.account_keys;
    let instructions = &entry.transaction.message.instructions;
    let mut out = Vec::new();

    // Native lamport deposits from balance diffs. The source of a diff is
    // not recoverable, so `from` stays empty.
    for (i, post) in meta.post_balances.iter().enumerate() {
        let pre = meta.pre_balances.get(i).copied().unwrap_or(0);
        if *post <= pre {
            continue;
        }
        let Some(key) = keys.get(i) else { continue };
        out.push(NormalizedTx {
            hash: signature.clone(),
            from: None,
            to: key.pubkey.clone(),
            value: U256::from(post - pre),
            block_number: slot,
            timestamp: block_time,
            token: None,
            symbol: None,
            fee: None,
            receipt: None,
        });
    }

    // SPL transfers from token balance pairs, keyed by accountIndex.
    // Senders (negative diffs) are collected first so receivers can name
    // their counterparty.
    let mut senders: Vec<(&str, &str)> = Vec::new(); // (mint, owner)
    for pre in &meta.pre_token_balances {
        let post_amount = meta
            .post_token_balances
            .iter()
            .find(|p| p.account_index == pre.account_index)
            .and_then(|p| amount_u256(&p.ui_token_amount.amount))
            .unwrap_or_default();
        let pre_amount = amount_u256(&pre.ui_token_amount.amount).unwrap_or_default();
        if pre_amount > post_amount {
            if let Some(owner) = pre.owner.as_deref() {
                senders.push((pre.mint.as_str(), owner));
            }
        }
    }

    for post in &meta.post_token_balances {
        let Some(owner) = post.owner.as_deref() else {
            continue;
        };
        let Some(post_amount) = amount_u256(&post.ui_token_amount.amount) else {
            continue;
        };
        let pre_amount = match meta
            .pre_token_balances
            .iter()
            .find(|p| p.account_index == post.account_index)
        {
            Some(pre) => match amount_u256(&pre.ui_token_amount.amount) {
                Some(a) => a,
                None => continue,
            },
            // Missing pre-balance only counts as zero when this transaction
            // created the destination's associated token account.
            None if has_create_ata(instructions, owner, &post.mint) => U256::zero(),
            None => continue,
        };
        if post_amount <= pre_amount {
            continue;
        }
        let from = senders
            .iter()
            .find(|(mint, sender)| *mint == post.mint && *sender != owner)
            .map(|(_, sender)| sender.to_string());
        if from.is_none() {
            debug!(target: "adapter::solana", signature = %signature, mint = %post.mint, "token deposit without recoverable sender dropped");
            continue;
        }
        out.push(NormalizedTx {
            hash: signature.clone(),
            from,
            to: owner.to_string(),
            value: post_amount - pre_amount,
            block_number: slot,
            timestamp: block_time,
            token: Some(post.mint.clone()),
            symbol: None,
            fee: None,
            receipt: None,
        });
    }

    // transferChecked instructions, harvested directly. The destination is
    // a token account; subscribers match it through their derived
    // associated-token-account aliases.
    for instr in instructions {
        if instr.get("program").and_then(Value::as_str) != Some("spl-token") {
            continue;
        }
        let Some(parsed) = instr.get("parsed") else {
            continue;
        };
        if parsed.get("type").and_then(Value::as_str) != Some("transferChecked") {
            continue;
        }
        let Some(info) = parsed.get("info") else {
            continue;
        };
        let (Some(mint), Some(destination), Some(authority)) = (
            info.get("mint").and_then(Value::as_str),
            info.get("destination").and_then(Value::as_str),
            info.get("authority").and_then(Value::as_str),
        ) else {
            continue;
        };
        let Some(value) = info
            .get("tokenAmount")
            .and_then(|a| a.get("amount"))
            .and_then(Value::as_str)
            .and_then(amount_u256)
        else {
            continue;
        };
        if value.is_zero() {
            continue;
        }
        out.push(NormalizedTx {
            hash: signature.clone(),
            from: Some(authority.to_string()),
            to: destination.to_string(),
            value,
            block_number: slot,
            timestamp: block_time,
            token: Some(mint.to_string()),
            symbol: None,
            fee: None,
            receipt: None,
        });
    }

    out
}

/// Associated token account for `(owner, mint)`, in base58.
pub(crate) fn derive_ata(owner: &Pubkey, mint: &Pubkey) -> String {
    let (ata, _bump) = Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_ID,
    );
    ata.to_string()
}

//================================================================================================//
//                                        ADAPTER                                                 //
//================================================================================================//

#[derive(Debug, Clone)]
pub struct SolanaAdapter {
    uri: String,
    client: reqwest::Client,
    interval: Duration,
    limiter: Arc<UpstreamLimiter>,
    disable_height_processing: bool,
}

impl SolanaAdapter {
    pub fn new(
        cfg: &BackendConfig,
        limiter: Arc<UpstreamLimiter>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            uri: cfg.uri.clone(),
            client: http_client(timeout)?,
            interval: cfg.block_read_interval(Backend::Solana),
            limiter,
            disable_height_processing: cfg.disable_height_processing,
        })
    }

    /// One JSON-RPC call. `Ok(None)` means the slot was skipped or purged.
    async fn rpc(&self, method: &'static str, params: Value) -> Result<Option<Value>, AdapterError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let envelope: RpcEnvelope = self
            .limiter
            .execute(method, || async {
                let resp = self.client.post(&self.uri).json(&body).send().await?;
                if !resp.status().is_success() {
                    return Err(AdapterError::UpstreamUnavailable(format!(
                        "{} returned {}",
                        method,
                        resp.status()
                    )));
                }
                resp.json::<RpcEnvelope>()
                    .await
                    .map_err(|e| AdapterError::Decode(e.to_string()))
            })
            .await?;

        if let Some(error) = envelope.error {
            if SKIPPED_SLOT_CODES.contains(&error.code) {
                return Ok(None);
            }
            return Err(AdapterError::Rpc(format!("{} ({})", error.message, error.code)));
        }
        Ok(envelope.result)
    }

    fn parse_pubkey(addr: &str) -> Result<Pubkey, AdapterError> {
        Pubkey::from_str(addr.trim()).map_err(|_| AdapterError::InvalidAddress(addr.to_string()))
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain(&self) -> ChainKind {
        ChainKind::Solana
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    fn height_polling_disabled(&self) -> bool {
        self.disable_height_processing
    }

    async fn height(&self) -> Result<u64, AdapterError> {
        let result = self
            .rpc("getSlot", json!([{ "commitment": "confirmed" }]))
            .await?
            .ok_or_else(|| AdapterError::Rpc("getSlot returned nothing".to_string()))?;
        result
            .as_u64()
            .ok_or_else(|| AdapterError::Decode("non-numeric slot".to_string()))
    }

    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError> {
        let params = json!([
            height,
            {
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "maxSupportedTransactionVersion": 0,
                "rewards": false,
            }
        ]);
        let Some(result) = self.rpc("getBlock", params).await? else {
            debug!(target: "adapter::solana", slot = height, "slot skipped");
            return Ok(Vec::new());
        };
        let block: SolanaBlock =
            serde_json::from_value(result).map_err(|e| AdapterError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for entry in &block.transactions {
            out.extend(normalize_entry(entry, height, block.block_time));
        }
        Ok(out)
    }

    /// SPL transfers are harvested inline from parsed blocks; nothing to
    /// install upstream.
    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError> {
        Self::parse_pubkey(token)?;
        Ok(())
    }

    /// No code-at-address probe over this surface; validity is syntactic.
    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError> {
        Ok(Self::parse_pubkey(addr).is_ok())
    }

    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError> {
        Ok(Self::parse_pubkey(addr)?.to_string())
    }

    fn match_aliases(&self, addr: &str, tokens: &[String]) -> Vec<String> {
        let mut aliases = vec![addr.to_string()];
        let Ok(owner) = Self::parse_pubkey(addr) else {
            return aliases;
        };
        for token in tokens {
            if let Ok(mint) = Self::parse_pubkey(token) {
                aliases.push(derive_ata(&owner, &mint));
            }
        }
        aliases
    }

    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let address = self.normalize_address(&query.address)?;
        let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(200) as usize;
        let result = self
            .rpc(
                "getSignaturesForAddress",
                json!([address, { "limit": page_size }]),
            )
            .await?
            .unwrap_or(Value::Array(Vec::new()));
        let signatures: Vec<SignatureInfo> =
            serde_json::from_value(result).map_err(|e| AdapterError::Decode(e.to_string()))?;

        let aliases = match &query.token_address {
            Some(mint) => self.match_aliases(&address, std::slice::from_ref(mint)),
            None => vec![address.clone()],
        };
        let mut out = Vec::new();
        for info in signatures {
            if info.err.is_some() && info.err != Some(Value::Null) {
                continue;
            }
            if let Some(from) = query.from_block {
                if info.slot < from {
                    continue;
                }
            }
            if let Some(to) = query.to_block {
                if info.slot > to {
                    continue;
                }
            }
            let params = json!([
                info.signature,
                { "encoding": "jsonParsed", "maxSupportedTransactionVersion": 0 }
            ]);
            let entry = match self.rpc("getTransaction", params).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    // One failed lookup of many never fails the query.
                    warn!(target: "adapter::solana", signature = %info.signature, error = %e, "getTransaction failed, dropping");
                    continue;
                }
            };
            let entry: SolanaTxEntry = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "adapter::solana", signature = %info.signature, error = %e, "unparseable transaction dropped");
                    continue;
                }
            };
            for tx in normalize_entry(&entry, info.slot, None) {
                if let Some(mint) = &query.token_address {
                    if tx.token.as_deref() != Some(mint.as_str()) {
                        continue;
                    }
                }
                let relevant = aliases.iter().any(|alias| *alias == tx.to)
                    || tx.from.as_deref() == Some(address.as_str());
                if relevant {
                    out.push(tx);
                }
            }
            if out.len() >= page_size {
                break;
            }
        }
        Ok(out)
    }
}
