//! HTTP JSON-RPC transport at `POST /jsonrpc` (plus `POST /ping` and the
//! Prometheus exposition at `GET /metrics`).
//!
//! Envelope validation is strict: `jsonrpc` must be `"2.0"`, `method` must
//! name a method registered for the selected backend, `params` (when
//! present) must be an array, and `id` must be an integer, string, or null.

use crate::errors::GatewayError;
use crate::metrics;
use crate::server::AppState;
use crate::types::{ChainKind, HistoryQuery};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let app = Router::new()
        .route("/jsonrpc", post(handle_jsonrpc))
        .route("/ping", post(handle_ping))
        .route("/metrics", get(handle_metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("rpc bind {}: {}", addr, e)))?;
    info!(target: "server::rpc", %addr, "JSON-RPC listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

async fn handle_ping() -> Json<Value> {
    Json(json!(["pong"]))
}

async fn handle_metrics() -> String {
    metrics::render()
}

fn envelope_ok(body: &Value) -> bool {
    if body.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return false;
    }
    if !body.get("method").map_or(false, Value::is_string) {
        return false;
    }
    if let Some(params) = body.get("params") {
        if !params.is_array() {
            return false;
        }
    }
    match body.get("id") {
        Some(Value::Null) | Some(Value::String(_)) => true,
        Some(Value::Number(n)) => n.is_i64() || n.is_u64(),
        _ => false,
    }
}

fn result_frame(id: &Value, result: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn error_frame(id: &Value, error: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "error": error }))
}

fn method_not_found(id: &Value) -> Json<Value> {
    error_frame(id, json!({ "code": -32601, "message": "Method not found" }))
}

fn first_param(body: &Value) -> Option<&Value> {
    body.get("params").and_then(Value::as_array).and_then(|p| p.first())
}

async fn handle_jsonrpc(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Json<Value> {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    if !envelope_ok(&body) {
        return error_frame(&id, json!("bad request format"));
    }
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();

    match method {
        "ping" => result_frame(&id, json!(["pong"])),
        "status" => match state.adapter.height().await {
            Ok(height) => result_frame(
                &id,
                json!({ "chain": state.chain, "backend": state.backend, "height": height }),
            ),
            Err(e) => {
                warn!(target: "server::rpc", error = %e, "status query failed");
                error_frame(&id, json!("failed to get status"))
            }
        },
        "getTransactionsByAddress" => {
            let Some(raw) = first_param(&body) else {
                return error_frame(&id, json!("missing address parameter"));
            };
            let query: HistoryQuery = match serde_json::from_value(raw.clone()) {
                Ok(query) => query,
                Err(_) => return error_frame(&id, json!("bad request format")),
            };
            if query.address.trim().is_empty() {
                return error_frame(&id, json!("missing address parameter"));
            }
            match state.adapter.transactions_by_address(&query).await {
                Ok(txs) => {
                    let wire: Vec<Value> = txs.iter().map(|tx| tx.to_wire(state.chain)).collect();
                    result_frame(&id, Value::Array(wire))
                }
                Err(e) => error_frame(&id, json!(e.to_string())),
            }
        }
        // Registered by the TON adapter only.
        "getTokenTransfers" if state.chain == ChainKind::Ton => {
            let Some(raw) = first_param(&body) else {
                return error_frame(&id, json!("missing address parameter"));
            };
            let address = raw.get("address").and_then(Value::as_str).unwrap_or_default();
            let token = raw.get("jettonMaster").and_then(Value::as_str).unwrap_or_default();
            if address.is_empty() || token.is_empty() {
                return error_frame(&id, json!("missing address parameter"));
            }
            match state.adapter.token_transfers(address, token).await {
                Ok(txs) => {
                    let wire: Vec<Value> = txs.iter().map(|tx| tx.to_wire(state.chain)).collect();
                    result_frame(&id, Value::Array(wire))
                }
                Err(e) => error_frame(&id, json!(e.to_string())),
            }
        }
        _ => method_not_found(&id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_validation() {
        let ok = json!({ "jsonrpc": "2.0", "method": "ping", "id": 1 });
        assert!(envelope_ok(&ok));
        let ok_null_id = json!({ "jsonrpc": "2.0", "method": "ping", "id": null });
        assert!(envelope_ok(&ok_null_id));
        let ok_params = json!({ "jsonrpc": "2.0", "method": "ping", "params": [], "id": "a" });
        assert!(envelope_ok(&ok_params));

        let bad_version = json!({ "jsonrpc": "1.0", "method": "ping", "id": 1 });
        assert!(!envelope_ok(&bad_version));
        let missing_id = json!({ "jsonrpc": "2.0", "method": "ping" });
        assert!(!envelope_ok(&missing_id));
        let object_params = json!({ "jsonrpc": "2.0", "method": "ping", "params": {}, "id": 1 });
        assert!(!envelope_ok(&object_params));
        let float_id = json!({ "jsonrpc": "2.0", "method": "ping", "id": 1.5 });
        assert!(!envelope_ok(&float_id));
    }
}
