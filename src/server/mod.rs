//! Inbound transports: the WebSocket subscription endpoint and the HTTP
//! JSON-RPC query surface. Both share one [`AppState`] wired to the selected
//! chain adapter.

use crate::adapters::ChainAdapter;
use crate::metrics::GatewayMetrics;
use crate::subscriptions::{ContractInterestSet, SubscriptionTable};
use crate::types::{Backend, ChainKind};
use std::sync::Arc;

pub mod rpc;
pub mod ws;

#[derive(Debug, Clone)]
pub struct AppState {
    pub backend: Backend,
    pub chain: ChainKind,
    pub adapter: Arc<dyn ChainAdapter>,
    pub table: Arc<SubscriptionTable>,
    pub contracts: Arc<ContractInterestSet>,
    pub metrics: &'static GatewayMetrics,
}

impl AppState {
    pub fn new(
        backend: Backend,
        adapter: Arc<dyn ChainAdapter>,
        table: Arc<SubscriptionTable>,
        contracts: Arc<ContractInterestSet>,
    ) -> Self {
        Self {
            backend,
            chain: backend.chain(),
            adapter,
            table,
            contracts,
            metrics: GatewayMetrics::global(),
        }
    }
}
