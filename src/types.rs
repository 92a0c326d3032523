//! # Core Gateway Types
//!
//! The chain-agnostic data model shared by every module: the normalized
//! transaction record produced by adapters and consumed by the matcher, the
//! chain discriminant, and the wire payload builders for the WebSocket side.

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

//================================================================================================//
//                                          CONSTANTS                                             //
//================================================================================================//

/// Hard cap on live `(connection, event)` subscription entries.
pub const MAX_SUBS: usize = 10_000;

/// Hard cap on distinct token contracts tracked per chain.
pub const MAX_TRACKED_CONTRACTS: usize = 50;

/// The single supported subscription topic.
pub const SUBSCRIBE_ACCOUNT: &str = "subscribeAccount";

//================================================================================================//
//                                    CHAIN DISCRIMINANTS                                         //
//================================================================================================//

/// The family a backend belongs to. Controls address canonicalization and
/// the wire key used for transaction hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Tron,
    Ton,
    Solana,
}

impl ChainKind {
    /// Wire key under which a transaction hash is serialized. Tron and
    /// Solana clients historically expect `txid`.
    pub fn hash_wire_key(&self) -> &'static str {
        match self {
            ChainKind::Tron | ChainKind::Solana => "txid",
            _ => "hash",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Evm => write!(f, "evm"),
            ChainKind::Tron => write!(f, "tron"),
            ChainKind::Ton => write!(f, "ton"),
            ChainKind::Solana => write!(f, "solana"),
        }
    }
}

/// A concrete upstream backend, selected by the first CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Hardhat,
    Ankr,
    Solana,
    Tron,
    Toncenter,
}

impl Backend {
    pub fn chain(&self) -> ChainKind {
        match self {
            Backend::Hardhat | Backend::Ankr => ChainKind::Evm,
            Backend::Solana => ChainKind::Solana,
            Backend::Tron => ChainKind::Tron,
            Backend::Toncenter => ChainKind::Ton,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Hardhat => "hardhat",
            Backend::Ankr => "ankr",
            Backend::Solana => "solana",
            Backend::Tron => "tron",
            Backend::Toncenter => "toncenter",
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hardhat" => Ok(Backend::Hardhat),
            "ankr" => Ok(Backend::Ankr),
            "solana" => Ok(Backend::Solana),
            "tron" => Ok(Backend::Tron),
            "toncenter" => Ok(Backend::Toncenter),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//================================================================================================//
//                                   NORMALIZED TRANSACTION                                       //
//================================================================================================//

/// The single shape crossing the boundary between chain adapters and the
/// matcher. All addresses are in the chain's canonical form; `value` is kept
/// as a 256-bit integer end-to-end and only stringified at the wire edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTx {
    /// Adapter-canonical encoding: hex for EVM/Tron, base64 for TON,
    /// signature for Solana.
    pub hash: String,
    /// Absent only when the adapter cannot recover the sender
    /// (Solana balance-diff derived transfers).
    pub from: Option<String>,
    pub to: String,
    /// Base-unit amount. May exceed 64 bits for EVM tokens.
    pub value: U256,
    /// Slot number for Solana.
    pub block_number: u64,
    /// Unix seconds unless the adapter documents otherwise.
    pub timestamp: Option<u64>,
    /// Token contract address for token transfers; `None` for native.
    pub token: Option<String>,
    pub symbol: Option<String>,
    /// Execution fee when the adapter fetched transaction info (Tron).
    pub fee: Option<U256>,
    /// Raw upstream receipt, passed through untouched.
    pub receipt: Option<Value>,
}

impl NormalizedTx {
    pub fn native(
        hash: impl Into<String>,
        from: Option<String>,
        to: impl Into<String>,
        value: U256,
        block_number: u64,
    ) -> Self {
        Self {
            hash: hash.into(),
            from,
            to: to.into(),
            value,
            block_number,
            timestamp: None,
            token: None,
            symbol: None,
            fee: None,
            receipt: None,
        }
    }

    /// A record that must never reach a subscriber: zero value, or a token
    /// transfer with no recoverable sender.
    pub fn is_droppable(&self) -> bool {
        if self.value.is_zero() {
            return true;
        }
        self.token.is_some() && self.from.is_none()
    }

    /// Wire form of the inner `tx` object. `value` is always a decimal
    /// string; the hash key follows the chain convention.
    pub fn to_wire(&self, chain: ChainKind) -> Value {
        let mut tx = json!({
            "height": self.block_number,
            chain.hash_wire_key(): self.hash,
            "to": self.to,
            "value": self.value.to_string(),
        });
        let obj = tx.as_object_mut().expect("tx wire object");
        if let Some(from) = &self.from {
            obj.insert("from".into(), json!(from));
        }
        if let Some(symbol) = &self.symbol {
            obj.insert("symbol".into(), json!(symbol));
        }
        if let Some(fee) = &self.fee {
            obj.insert("fee".into(), json!(fee.to_string()));
        }
        if let Some(receipt) = &self.receipt {
            obj.insert("receipt".into(), receipt.clone());
        }
        tx
    }
}

//================================================================================================//
//                                      HISTORICAL QUERIES                                        //
//================================================================================================//

/// Parameters of the `getTransactionsByAddress` RPC method.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub address: String,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub page_size: Option<u32>,
    #[serde(rename = "token_address")]
    pub token_address: Option<String>,
}

/// Event payload sent to one subscriber for one matched transaction.
pub fn match_payload(chain: ChainKind, addr: &str, tx: &NormalizedTx) -> Value {
    let mut data = json!({
        "event": SUBSCRIBE_ACCOUNT,
        "addr": addr,
        "tx": tx.to_wire(chain),
    });
    if let Some(token) = &tx.token {
        data.as_object_mut()
            .expect("payload object")
            .insert("token".into(), json!(token));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_value_is_decimal_string() {
        let tx = NormalizedTx::native(
            "0xabc",
            Some("0xf00".into()),
            "0xbar",
            U256::from_dec_str("1000000000000000000").unwrap(),
            7,
        );
        let wire = tx.to_wire(ChainKind::Evm);
        assert_eq!(wire["value"], "1000000000000000000");
        assert_eq!(wire["hash"], "0xabc");
        assert_eq!(wire["height"], 7);
    }

    #[test]
    fn tron_and_solana_use_txid_key() {
        let tx = NormalizedTx::native("14f76e", None, "TSSZ", U256::from(1u64), 1);
        assert_eq!(tx.to_wire(ChainKind::Tron)["txid"], "14f76e");
        assert_eq!(tx.to_wire(ChainKind::Solana)["txid"], "14f76e");
        assert!(tx.to_wire(ChainKind::Ton).get("txid").is_none());
    }

    #[test]
    fn zero_value_and_senderless_token_are_droppable() {
        let mut tx = NormalizedTx::native("h", None, "a", U256::zero(), 1);
        assert!(tx.is_droppable());
        tx.value = U256::one();
        assert!(!tx.is_droppable());
        tx.token = Some("tok".into());
        assert!(tx.is_droppable());
        tx.from = Some("b".into());
        assert!(!tx.is_droppable());
    }
}
