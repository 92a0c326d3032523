//! WebSocket transport and connection lifecycle.
//!
//! Accept mints a 128-bit connection id and registers the close hook; each
//! connection gets a read loop plus a writer task fed by a bounded channel.
//! Delivery through [`WsSink`] is `try_send`-only, so a slow consumer drops
//! frames instead of stalling the dispatcher.

use crate::errors::{DeliveryError, GatewayError, SubscribeError};
use crate::server::AppState;
use crate::subscriptions::{ConnId, EventKind, EventSink, Interest};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection before drops begin.
const OUTBOUND_BUFFER: usize = 256;

pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let app = Router::new().route("/", get(ws_upgrade)).with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("ws bind {}: {}", addr, e)))?;
    info!(target: "server::ws", %addr, "WebSocket listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection delivery callbacks, bound to the writer channel.
#[derive(Debug, Clone)]
struct WsSink {
    tx: mpsc::Sender<String>,
}

impl EventSink for WsSink {
    fn deliver(&self, frame: Value) -> Result<(), DeliveryError> {
        self.tx.try_send(frame.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::ChannelFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn protocol_error(&self, message: &str) {
        let _ = self.tx.try_send(json!({ "error": message }).to_string());
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let cid = ConnId::mint();
    let chain_label = state.chain.to_string();
    state
        .metrics
        .active_connections
        .with_label_values(&[&chain_label])
        .inc();
    info!(target: "server::ws", %cid, "connection accepted");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
    let sink = Arc::new(WsSink { tx });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&state, cid, sink.clone(), &text).await,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // Close hook: tombstone the row, keep contract interests (reconnects
    // would otherwise thrash upstream filters).
    state.table.close_cid(cid).await;
    state
        .metrics
        .active_connections
        .with_label_values(&[&chain_label])
        .dec();
    writer.abort();
    info!(target: "server::ws", %cid, "connection closed");
}

async fn handle_frame(state: &Arc<AppState>, cid: ConnId, sink: Arc<WsSink>, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        sink.protocol_error(&SubscribeError::BadRequest.to_string());
        return;
    };
    let Some(method) = frame.get("method").and_then(Value::as_str) else {
        sink.protocol_error(&SubscribeError::BadRequest.to_string());
        return;
    };
    let id = frame.get("id").cloned();

    let Some(EventKind::SubscribeAccount) = EventKind::parse(method) else {
        debug!(target: "server::ws", %cid, method, "unknown method");
        send_error(&sink, &id, &format!("unknown method: {}", method));
        return;
    };

    match subscribe_account(state, cid, sink.clone(), &frame).await {
        Ok(()) => {
            let mut ack = json!({ "error": false });
            if let Some(id) = &id {
                ack.as_object_mut().expect("ack object").insert("id".into(), id.clone());
            }
            if let Err(e) = sink.deliver(ack) {
                warn!(target: "server::ws", %cid, error = %e, "ack delivery failed");
            }
        }
        Err(message) => send_error(&sink, &id, &message),
    }
}

fn send_error(sink: &Arc<WsSink>, id: &Option<Value>, message: &str) {
    let mut frame = json!({ "error": message });
    if let Some(id) = id {
        frame.as_object_mut().expect("error object").insert("id".into(), id.clone());
    }
    let _ = sink.deliver(frame);
}

/// Validates and installs one `subscribeAccount` request:
/// `params = [address, [token…]]`. The connection's state is unchanged on
/// any error.
async fn subscribe_account(
    state: &Arc<AppState>,
    cid: ConnId,
    sink: Arc<WsSink>,
    frame: &Value,
) -> Result<(), String> {
    let params = frame.get("params").and_then(Value::as_array);
    let Some(address_raw) = params
        .and_then(|p| p.first())
        .and_then(Value::as_str)
        .filter(|a| !a.trim().is_empty())
    else {
        return Err(SubscribeError::MissingAddress.to_string());
    };
    let tokens_raw: Vec<&str> = params
        .and_then(|p| p.get(1))
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let address = state
        .adapter
        .normalize_address(address_raw)
        .map_err(|e| e.to_string())?;
    if !state.adapter.is_account(&address).await.map_err(|e| e.to_string())? {
        return Err(SubscribeError::NotAnAccount(address).to_string());
    }

    let mut tokens = Vec::with_capacity(tokens_raw.len());
    for raw in tokens_raw {
        let token = state.adapter.normalize_address(raw).map_err(|e| e.to_string())?;
        // The one place the account/contract distinction matters.
        if state.adapter.is_account(&token).await.map_err(|e| e.to_string())? {
            return Err(SubscribeError::NotAContract(token).to_string());
        }
        tokens.push(token);
    }

    let aliases = state.adapter.match_aliases(&address, &tokens);
    let interest = Interest::new(address.clone(), tokens.clone()).with_aliases(aliases);
    state
        .table
        .add_sub(cid, EventKind::SubscribeAccount, sink, vec![interest])
        .await
        .map_err(|e| e.to_string())?;
    info!(target: "server::ws", %cid, address = %address, tokens = tokens.len(), "subscribed");

    for token in &tokens {
        if state.contracts.insert(token).await {
            if let Err(e) = state.adapter.subscribe_contract(token).await {
                // Soft: the subscription stands, history reconciles.
                warn!(target: "server::ws", token = %token, error = %e, "upstream contract filter installation failed");
            }
        }
    }
    Ok(())
}
