//! Shared mocks for the integration suite: a scriptable chain adapter and a
//! frame-capturing event sink.

use async_trait::async_trait;
use chaingate::adapters::ChainAdapter;
use chaingate::errors::{AdapterError, DeliveryError};
use chaingate::subscriptions::EventSink;
use chaingate::types::{ChainKind, HistoryQuery, NormalizedTx};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

// === Mock Chain Adapter ===

#[derive(Debug)]
pub struct MockChainAdapter {
    pub chain: ChainKind,
    pub tip: AtomicU64,
    pub blocks: RwLock<HashMap<u64, Vec<NormalizedTx>>>,
    /// Heights whose `txs_at` fails until removed.
    pub failing_heights: RwLock<HashSet<u64>>,
    /// Addresses treated as contracts by `is_account`.
    pub known_contracts: RwLock<HashSet<String>>,
    pub subscribed_contracts: Mutex<Vec<String>>,
    pub txs_at_calls: AtomicU64,
    pub height_calls: AtomicU64,
    pub disable_height_processing: bool,
}

impl MockChainAdapter {
    pub fn new(chain: ChainKind, tip: u64) -> Self {
        Self {
            chain,
            tip: AtomicU64::new(tip),
            blocks: RwLock::new(HashMap::new()),
            failing_heights: RwLock::new(HashSet::new()),
            known_contracts: RwLock::new(HashSet::new()),
            subscribed_contracts: Mutex::new(Vec::new()),
            txs_at_calls: AtomicU64::new(0),
            height_calls: AtomicU64::new(0),
            disable_height_processing: false,
        }
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn put_block(&self, height: u64, txs: Vec<NormalizedTx>) {
        self.blocks.write().unwrap().insert(height, txs);
    }

    pub fn fail_height(&self, height: u64) {
        self.failing_heights.write().unwrap().insert(height);
    }

    pub fn heal_height(&self, height: u64) {
        self.failing_heights.write().unwrap().remove(&height);
    }

    pub fn mark_contract(&self, addr: &str) {
        self.known_contracts.write().unwrap().insert(addr.to_lowercase());
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn height_polling_disabled(&self) -> bool {
        self.disable_height_processing
    }

    async fn height(&self) -> Result<u64, AdapterError> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn txs_at(&self, height: u64) -> Result<Vec<NormalizedTx>, AdapterError> {
        self.txs_at_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_heights.read().unwrap().contains(&height) {
            return Err(AdapterError::UpstreamUnavailable(format!(
                "mock failure at height {}",
                height
            )));
        }
        Ok(self
            .blocks
            .read()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_contract(&self, token: &str) -> Result<(), AdapterError> {
        self.subscribed_contracts.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn is_account(&self, addr: &str) -> Result<bool, AdapterError> {
        Ok(!self.known_contracts.read().unwrap().contains(&addr.to_lowercase()))
    }

    fn normalize_address(&self, addr: &str) -> Result<String, AdapterError> {
        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(AdapterError::InvalidAddress(addr.to_string()));
        }
        Ok(trimmed.to_lowercase())
    }

    async fn transactions_by_address(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<NormalizedTx>, AdapterError> {
        let address = self.normalize_address(&query.address)?;
        let blocks = self.blocks.read().unwrap();
        let mut heights: Vec<u64> = blocks.keys().copied().collect();
        heights.sort_unstable();
        let mut out = Vec::new();
        for height in heights {
            for tx in &blocks[&height] {
                if tx.to == address || tx.from.as_deref() == Some(address.as_str()) {
                    out.push(tx.clone());
                }
            }
        }
        Ok(out)
    }
}

// === Capturing Event Sink ===

#[derive(Debug, Default)]
pub struct CapturingSink {
    pub frames: Mutex<Vec<Value>>,
    pub errors: Mutex<Vec<String>>,
    pub reject_deliveries: std::sync::atomic::AtomicBool,
}

impl CapturingSink {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    pub fn data_frames(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("data").is_some())
            .collect()
    }
}

impl EventSink for CapturingSink {
    fn deliver(&self, frame: Value) -> Result<(), DeliveryError> {
        if self.reject_deliveries.load(Ordering::SeqCst) {
            return Err(DeliveryError::ChannelFull);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn protocol_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}
