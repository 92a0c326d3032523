//! # Height Poller
//!
//! One long-lived task per chain adapter: discover new heights, fetch their
//! transactions, feed the matcher. The loop is the single writer of the
//! height cursor; missed ticks are skipped rather than queued, so iterations
//! never overlap. With nobody subscribed the cursor tracks the tip without
//! fetching a single block.
//!
//! Failure policy: a height whose fetch fails is retried on subsequent
//! wakes, up to [`MAX_HEIGHT_RETRIES`] consecutive failures, then skipped.

use crate::adapters::ChainAdapter;
use crate::errors::AdapterError;
use crate::matcher::{dispatch_tx, DedupKey};
use crate::metrics::GatewayMetrics;
use crate::subscriptions::{EventKind, SubscriptionTable};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive failures tolerated for a single height before it is skipped.
pub const MAX_HEIGHT_RETRIES: u32 = 3;

#[derive(Debug)]
pub struct HeightPoller {
    adapter: Arc<dyn ChainAdapter>,
    table: Arc<SubscriptionTable>,
    last_processed_height: u64,
    retry_height: u64,
    retries: u32,
    metrics: &'static GatewayMetrics,
}

impl HeightPoller {
    /// Initializes the cursor at the adapter's current height so the first
    /// poll does not replay history. Failure here is fatal for the process.
    pub async fn init(
        adapter: Arc<dyn ChainAdapter>,
        table: Arc<SubscriptionTable>,
    ) -> Result<Self, AdapterError> {
        let start = if adapter.height_polling_disabled() {
            0
        } else {
            adapter.height().await?
        };
        info!(target: "poller", chain = %adapter.chain(), start, "height poller initialized");
        Ok(Self {
            adapter,
            table,
            last_processed_height: start,
            retry_height: 0,
            retries: 0,
            metrics: GatewayMetrics::global(),
        })
    }

    pub fn last_processed_height(&self) -> u64 {
        self.last_processed_height
    }

    /// One poll cycle: snapshot subscribers, walk `last+1..=tip`, dispatch.
    pub async fn tick(&mut self) {
        let chain = self.adapter.chain();
        let chain_label = chain.to_string();

        let subs = self.table.subs_for_event(EventKind::SubscribeAccount).await;
        if subs.is_empty() {
            // Nobody listening: follow the tip, generate no upstream block
            // load, deliver nothing.
            match self.adapter.height().await {
                Ok(tip) => {
                    self.last_processed_height = tip;
                    self.retries = 0;
                }
                Err(e) => {
                    warn!(target: "poller", chain = %chain, error = %e, "idle height check failed");
                }
            }
            return;
        }

        let tip = match self.adapter.height().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(target: "poller", chain = %chain, error = %e, "height discovery failed");
                self.metrics
                    .upstream_errors
                    .with_label_values(&[&chain_label, "height"])
                    .inc();
                return;
            }
        };

        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut height = self.last_processed_height + 1;
        while height <= tip {
            match self.adapter.txs_at(height).await {
                Ok(txs) => {
                    self.metrics
                        .blocks_processed
                        .with_label_values(&[&chain_label])
                        .inc();
                    self.metrics
                        .txs_normalized
                        .with_label_values(&[&chain_label])
                        .inc_by(txs.len() as u64);
                    for tx in &txs {
                        dispatch_tx(chain, tx, &subs, &mut seen, self.metrics);
                    }
                    self.last_processed_height = height;
                    self.retries = 0;
                    height += 1;
                }
                Err(e) => {
                    self.metrics
                        .upstream_errors
                        .with_label_values(&[&chain_label, "txs_at"])
                        .inc();
                    if self.retry_height != height {
                        self.retry_height = height;
                        self.retries = 0;
                    }
                    self.retries += 1;
                    if self.retries >= MAX_HEIGHT_RETRIES {
                        error!(target: "poller", chain = %chain, height, error = %e, "height skipped after repeated failures");
                        self.last_processed_height = height;
                        self.retries = 0;
                        height += 1;
                    } else {
                        warn!(target: "poller", chain = %chain, height, attempt = self.retries, error = %e, "height fetch failed, retrying next cycle");
                        break;
                    }
                }
            }
        }
    }

    /// The long-lived loop. Returns only on cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        let chain = self.adapter.chain();
        if self.adapter.height_polling_disabled() {
            info!(target: "poller", chain = %chain, "height processing disabled, poller idle");
            cancel.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval(self.adapter.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "poller", chain = %chain, interval_ms = self.adapter.poll_interval().as_millis() as u64, "height poller running");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(target: "poller", chain = %chain, "height poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    debug!(target: "poller", chain = %chain, last = self.last_processed_height, "cycle complete");
                }
            }
        }
    }
}

/// Spawns the per-chain poller after its fatal-on-failure initialization.
pub async fn run_height_poller(
    adapter: Arc<dyn ChainAdapter>,
    table: Arc<SubscriptionTable>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, AdapterError> {
    let poller = HeightPoller::init(adapter, table).await?;
    Ok(tokio::spawn(poller.run(cancel)))
}
