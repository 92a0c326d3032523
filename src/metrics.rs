//! # Global Metrics Registry
//!
//! Prometheus metrics for the gateway, centralized so the observability
//! surface has a single point of reference. Exposed by the RPC server at
//! `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

/// Counters and gauges for the subscription engine.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub blocks_processed: &'static IntCounterVec,
    pub txs_normalized: &'static IntCounterVec,
    pub events_dispatched: &'static IntCounterVec,
    pub upstream_errors: &'static IntCounterVec,
    pub delivery_failures: &'static IntCounterVec,
    pub active_connections: &'static IntGaugeVec,
    pub live_subscriptions: &'static IntGaugeVec,
}

impl GatewayMetrics {
    pub fn global() -> &'static Self {
        static INSTANCE: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
            blocks_processed: &BLOCKS_PROCESSED,
            txs_normalized: &TXS_NORMALIZED,
            events_dispatched: &EVENTS_DISPATCHED,
            upstream_errors: &UPSTREAM_ERRORS,
            delivery_failures: &DELIVERY_FAILURES,
            active_connections: &ACTIVE_CONNECTIONS,
            live_subscriptions: &LIVE_SUBSCRIPTIONS,
        });
        &INSTANCE
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

pub static BLOCKS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_blocks_processed_total",
        "Heights fetched and fed to the matcher.",
        &["chain"]
    )
    .expect("Failed to register gateway_blocks_processed_total")
});

pub static TXS_NORMALIZED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_txs_normalized_total",
        "Normalized transactions emitted by adapters.",
        &["chain"]
    )
    .expect("Failed to register gateway_txs_normalized_total")
});

pub static EVENTS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_events_dispatched_total",
        "Matched events delivered to subscriber channels.",
        &["chain"]
    )
    .expect("Failed to register gateway_events_dispatched_total")
});

pub static UPSTREAM_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_upstream_errors_total",
        "Soft upstream failures, labeled by operation.",
        &["chain", "op"]
    )
    .expect("Failed to register gateway_upstream_errors_total")
});

pub static DELIVERY_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_delivery_failures_total",
        "Events dropped because a subscriber channel was full or closed.",
        &["chain"]
    )
    .expect("Failed to register gateway_delivery_failures_total")
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "gateway_active_connections",
        "Open WebSocket connections.",
        &["chain"]
    )
    .expect("Failed to register gateway_active_connections")
});

pub static LIVE_SUBSCRIPTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "gateway_live_subscriptions",
        "Live (connection, event) subscription entries.",
        &["chain"]
    )
    .expect("Failed to register gateway_live_subscriptions")
});

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
