//! # Subscription State
//!
//! The in-memory interest index the live-event engine dispatches against:
//! per-connection subscription entries keyed by `(ConnId, EventKind)`, and
//! the capped set of token contracts any live subscriber cares about.
//!
//! Mutation happens on the connection's task; the poller takes copy-on-read
//! snapshots before dispatch, so sweeping and matching never race. A closed
//! connection leaves a tombstone that a periodic sweeper reclaims, which
//! keeps `add_sub` calls racing with a close from resurrecting state.

use crate::errors::{DeliveryError, SubscribeError};
use crate::metrics::GatewayMetrics;
use crate::types::{ChainKind, MAX_SUBS, MAX_TRACKED_CONTRACTS, SUBSCRIBE_ACCOUNT};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a tombstone lingers before the sweeper may reclaim it.
pub const TOMBSTONE_RECLAIM_AFTER: Duration = Duration::from_secs(5);
/// Sweeper wake interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

//================================================================================================//
//                                       IDENTIFIERS                                              //
//================================================================================================//

/// Opaque 128-bit connection identity, minted at WebSocket accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Subscription topics. Fixed set; the engine is not a general broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SubscribeAccount,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscribeAccount => SUBSCRIBE_ACCOUNT,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            SUBSCRIBE_ACCOUNT => Some(EventKind::SubscribeAccount),
            _ => None,
        }
    }
}

//================================================================================================//
//                                    SINKS & INTERESTS                                           //
//================================================================================================//

/// Delivery callbacks bound to one connection's transport. Implementations
/// must be non-blocking: a slow consumer drops frames, it never stalls the
/// dispatcher.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn deliver(&self, frame: Value) -> Result<(), DeliveryError>;
    fn protocol_error(&self, message: &str);
}

/// One `(address, tokens)` interest of a subscription. `aliases` holds the
/// precomputed chain-specific alternates the matcher also compares against
/// (Solana associated token accounts); it always contains `address` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub address: String,
    pub tokens: Vec<String>,
    pub aliases: Vec<String>,
}

impl Interest {
    pub fn new(address: impl Into<String>, tokens: Vec<String>) -> Self {
        let address = address.into();
        Self {
            aliases: vec![address.clone()],
            address,
            tokens,
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        if !aliases.is_empty() {
            self.aliases = aliases;
        }
        if !self.aliases.contains(&self.address) {
            self.aliases.insert(0, self.address.clone());
        }
        self
    }
}

/// A live subscription: interests plus the delivery sink.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub interests: Vec<Interest>,
    pub sink: Arc<dyn EventSink>,
}

/// Snapshot row handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct SubSnapshot {
    pub cid: ConnId,
    pub interests: Vec<Interest>,
    pub sink: Arc<dyn EventSink>,
}

enum ConnEntry {
    Live(HashMap<EventKind, Subscription>),
    /// Sentinel left by `close_cid`; reclaimed by the sweeper.
    Tombstone(Instant),
}

//================================================================================================//
//                                    SUBSCRIPTION TABLE                                          //
//================================================================================================//

#[derive(Debug)]
pub struct SubscriptionTable {
    chain: ChainKind,
    inner: RwLock<HashMap<ConnId, ConnEntry>>,
    metrics: &'static GatewayMetrics,
}

impl fmt::Debug for ConnEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnEntry::Live(subs) => write!(f, "Live({} events)", subs.len()),
            ConnEntry::Tombstone(at) => write!(f, "Tombstone({:?})", at),
        }
    }
}

impl SubscriptionTable {
    pub fn new(chain: ChainKind) -> Self {
        Self {
            chain,
            inner: RwLock::new(HashMap::new()),
            metrics: GatewayMetrics::global(),
        }
    }

    /// Creates or extends the subscription for `(cid, event)`.
    ///
    /// Silently drops the call when the connection is tombstoned (it is
    /// closing; the client will not observe the difference). Fails with
    /// `CapacityExceeded` once the table holds [`MAX_SUBS`] live entries,
    /// and with `AlreadySubscribed` when any incoming address is already
    /// present for this `(cid, event)`.
    pub async fn add_sub(
        &self,
        cid: ConnId,
        event: EventKind,
        sink: Arc<dyn EventSink>,
        interests: Vec<Interest>,
    ) -> Result<(), SubscribeError> {
        let mut table = self.inner.write().await;

        match table.get(&cid) {
            Some(ConnEntry::Tombstone(_)) => {
                debug!(target: "subs", %cid, "add_sub on closing connection dropped");
                return Ok(());
            }
            Some(ConnEntry::Live(subs)) if !subs.contains_key(&event) => {
                if live_entry_count(&table) >= MAX_SUBS {
                    return Err(SubscribeError::CapacityExceeded);
                }
            }
            None => {
                if live_entry_count(&table) >= MAX_SUBS {
                    return Err(SubscribeError::CapacityExceeded);
                }
            }
            _ => {}
        }

        let entry = table.entry(cid).or_insert_with(|| ConnEntry::Live(HashMap::new()));
        let subs = match entry {
            ConnEntry::Live(subs) => subs,
            ConnEntry::Tombstone(_) => unreachable!("tombstone handled above"),
        };

        match subs.get(&event) {
            Some(existing) => {
                for interest in &interests {
                    if existing.interests.iter().any(|i| i.address == interest.address) {
                        return Err(SubscribeError::AlreadySubscribed(interest.address.clone()));
                    }
                }
                // Interests are replaced wholesale, never mutated in place:
                // snapshots taken before this point keep the old slice.
                let mut merged = existing.interests.clone();
                merged.extend(interests);
                let sub = Subscription {
                    interests: merged,
                    sink: existing.sink.clone(),
                };
                subs.insert(event, sub);
            }
            None => {
                subs.insert(event, Subscription { interests, sink });
                self.metrics
                    .live_subscriptions
                    .with_label_values(&[&self.chain.to_string()])
                    .set(live_entry_count(&table) as i64);
            }
        }
        Ok(())
    }

    /// Copy-on-read snapshot for dispatch. Safe to call concurrently with
    /// any mutation; the returned rows never change under the caller.
    pub async fn subs_for_event(&self, event: EventKind) -> Vec<SubSnapshot> {
        let table = self.inner.read().await;
        let mut out = Vec::new();
        for (cid, entry) in table.iter() {
            if let ConnEntry::Live(subs) = entry {
                if let Some(sub) = subs.get(&event) {
                    out.push(SubSnapshot {
                        cid: *cid,
                        interests: sub.interests.clone(),
                        sink: sub.sink.clone(),
                    });
                }
            }
        }
        out
    }

    /// Current interests for `(cid, event)`, if the connection is live.
    pub async fn cid_interests(&self, cid: ConnId, event: EventKind) -> Option<Vec<Interest>> {
        let table = self.inner.read().await;
        match table.get(&cid)? {
            ConnEntry::Live(subs) => subs.get(&event).map(|s| s.interests.clone()),
            ConnEntry::Tombstone(_) => None,
        }
    }

    pub async fn live_count(&self) -> usize {
        live_entry_count(&*self.inner.read().await)
    }

    /// Marks the connection closed. Its row becomes a tombstone the sweeper
    /// reclaims after [`TOMBSTONE_RECLAIM_AFTER`].
    pub async fn close_cid(&self, cid: ConnId) {
        let mut table = self.inner.write().await;
        if table.insert(cid, ConnEntry::Tombstone(Instant::now())).is_some() {
            debug!(target: "subs", %cid, "connection tombstoned");
        }
        self.metrics
            .live_subscriptions
            .with_label_values(&[&self.chain.to_string()])
            .set(live_entry_count(&table) as i64);
    }

    /// Removes tombstones older than the reclaim threshold. Returns how many
    /// rows were reclaimed.
    pub async fn sweep(&self) -> usize {
        let mut table = self.inner.write().await;
        let before = table.len();
        table.retain(|_, entry| match entry {
            ConnEntry::Live(_) => true,
            ConnEntry::Tombstone(at) => at.elapsed() < TOMBSTONE_RECLAIM_AFTER,
        });
        before - table.len()
    }
}

fn live_entry_count(table: &HashMap<ConnId, ConnEntry>) -> usize {
    table
        .values()
        .map(|entry| match entry {
            ConnEntry::Live(subs) => subs.len(),
            ConnEntry::Tombstone(_) => 0,
        })
        .sum()
}

/// Periodic tombstone reclamation, one task per process.
pub async fn run_sweeper(table: Arc<SubscriptionTable>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(target: "subs::sweeper", "sweeper stopped");
                break;
            }
            _ = ticker.tick() => {
                let reclaimed = table.sweep().await;
                if reclaimed > 0 {
                    debug!(target: "subs::sweeper", reclaimed, "reclaimed tombstoned connections");
                }
            }
        }
    }
}

//================================================================================================//
//                                   CONTRACT INTEREST SET                                        //
//================================================================================================//

/// The union of token contracts any live subscription references, capped at
/// [`MAX_TRACKED_CONTRACTS`] per chain. Entries persist for process lifetime;
/// membership controls which upstream log filters the adapter installs.
#[derive(Debug)]
pub struct ContractInterestSet {
    chain: ChainKind,
    inner: RwLock<HashSet<String>>,
}

impl ContractInterestSet {
    pub fn new(chain: ChainKind) -> Self {
        Self {
            chain,
            inner: RwLock::new(HashSet::new()),
        }
    }

    /// Returns `true` when `token` was newly inserted and the adapter should
    /// install its upstream filter. Past the cap the insert is dropped.
    pub async fn insert(&self, token: &str) -> bool {
        let mut set = self.inner.write().await;
        if set.contains(token) {
            return false;
        }
        if set.len() >= MAX_TRACKED_CONTRACTS {
            warn!(
                target: "subs::contracts",
                chain = %self.chain,
                token,
                cap = MAX_TRACKED_CONTRACTS,
                "contract interest cap reached, token not tracked"
            );
            return false;
        }
        set.insert(token.to_string())
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.inner.read().await.contains(token)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.read().await.iter().cloned().collect()
    }
}
