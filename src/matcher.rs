//! # Matcher / Dispatcher
//!
//! The pure heart of the live engine: given one normalized transaction and a
//! snapshot of subscriptions, decide who hears about it and push the frame
//! into each winner's sink. No I/O, no suspension; dedup is enforced per
//! poll cycle on the `(connection, hash, address, token)` key.

use crate::metrics::GatewayMetrics;
use crate::subscriptions::{ConnId, Interest, SubSnapshot};
use crate::types::{match_payload, ChainKind, NormalizedTx, SUBSCRIBE_ACCOUNT};
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

/// At-most-once key for one poll cycle.
pub type DedupKey = (ConnId, String, String, Option<String>);

/// Subscribed addresses within `interests` that `tx` touches.
///
/// Native side: the transaction carries no token and either endpoint equals
/// one of the interest's aliases (the subscribed address itself, plus any
/// chain-derived alternates such as Solana associated token accounts).
/// Token side: the interest must list the transaction's token, and the
/// subscribed address (or an alias, for chains whose transfers target
/// derived accounts) must appear on either end.
pub fn matching_addresses<'a>(tx: &NormalizedTx, interests: &'a [Interest]) -> Vec<&'a str> {
    let mut hits = Vec::new();
    for interest in interests {
        let hit = match &tx.token {
            None => interest
                .aliases
                .iter()
                .any(|alias| tx.from.as_deref() == Some(alias.as_str()) || tx.to == *alias),
            Some(token) => {
                interest.tokens.iter().any(|t| t == token)
                    && interest
                        .aliases
                        .iter()
                        .any(|alias| tx.from.as_deref() == Some(alias.as_str()) || tx.to == *alias)
            }
        };
        if hit {
            hits.push(interest.address.as_str());
        }
    }
    hits
}

/// Fans one transaction out to every matching subscription. Returns how many
/// frames were handed to sinks. `seen` carries the cycle's dedup state.
pub fn dispatch_tx(
    chain: ChainKind,
    tx: &NormalizedTx,
    subs: &[SubSnapshot],
    seen: &mut HashSet<DedupKey>,
    metrics: &GatewayMetrics,
) -> usize {
    if tx.is_droppable() {
        return 0;
    }
    let chain_label = chain.to_string();
    let mut delivered = 0;

    for snap in subs {
        for addr in matching_addresses(tx, &snap.interests) {
            let key = (snap.cid, tx.hash.clone(), addr.to_string(), tx.token.clone());
            if !seen.insert(key) {
                continue;
            }
            let frame = json!({
                "error": false,
                "event": SUBSCRIBE_ACCOUNT,
                "data": match_payload(chain, addr, tx),
            });
            match snap.sink.deliver(frame) {
                Ok(()) => {
                    delivered += 1;
                    metrics
                        .events_dispatched
                        .with_label_values(&[&chain_label])
                        .inc();
                }
                Err(e) => {
                    // No retry, no forced disconnect; the next event tries
                    // again on the same channel.
                    warn!(target: "matcher", cid = %snap.cid, error = %e, "event delivery failed");
                    metrics
                        .delivery_failures
                        .with_label_values(&[&chain_label])
                        .inc();
                }
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeliveryError;
    use crate::subscriptions::EventSink;
    use ethers::types::U256;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct CapturingSink {
        frames: Mutex<Vec<Value>>,
    }

    impl EventSink for CapturingSink {
        fn deliver(&self, frame: Value) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
        fn protocol_error(&self, _message: &str) {}
    }

    fn snapshot(interests: Vec<Interest>) -> (SubSnapshot, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink::default());
        (
            SubSnapshot {
                cid: ConnId::mint(),
                interests,
                sink: sink.clone(),
            },
            sink,
        )
    }

    const SUB_ADDR: &str = "0xf8200ce84c3151f64a79e723245544e1e58badec";
    const OTHER: &str = "0x0000000000000000000000000000000000000001";
    const TOKEN: &str = "0xbf43558373b4ed1e024186f18f611c0e209d1cec";

    fn native_tx(to: &str, value: u64) -> NormalizedTx {
        NormalizedTx::native("0xhash1", Some(OTHER.into()), to, U256::from(value), 100)
    }

    #[test]
    fn native_match_fires_once_with_decimal_value() {
        let (snap, sink) = snapshot(vec![Interest::new(SUB_ADDR, vec![])]);
        let tx = NormalizedTx::native(
            "0xhash1",
            Some(OTHER.into()),
            SUB_ADDR,
            U256::from_dec_str("1000000000000000000").unwrap(),
            100,
        );
        let mut seen = HashSet::new();
        let n = dispatch_tx(ChainKind::Evm, &tx, &[snap], &mut seen, GatewayMetrics::global());
        assert_eq!(n, 1);
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["error"], false);
        assert_eq!(frames[0]["event"], SUBSCRIBE_ACCOUNT);
        assert_eq!(frames[0]["data"]["addr"], SUB_ADDR);
        assert_eq!(frames[0]["data"]["tx"]["value"], "1000000000000000000");
    }

    #[test]
    fn interest_isolation() {
        let (interested, interested_sink) = snapshot(vec![Interest::new(SUB_ADDR, vec![])]);
        let (bystander, bystander_sink) = snapshot(vec![Interest::new(OTHER, vec![])]);
        // Bystander subscribed to OTHER, which is the sender here; both fire,
        // but each only for its own address.
        let tx = native_tx(SUB_ADDR, 10);
        let mut seen = HashSet::new();
        dispatch_tx(
            ChainKind::Evm,
            &tx,
            &[interested, bystander],
            &mut seen,
            GatewayMetrics::global(),
        );
        assert_eq!(interested_sink.frames.lock().unwrap()[0]["data"]["addr"], SUB_ADDR);
        assert_eq!(bystander_sink.frames.lock().unwrap()[0]["data"]["addr"], OTHER);

        let (unrelated, unrelated_sink) = snapshot(vec![Interest::new(
            "0x00000000000000000000000000000000000000ff",
            vec![],
        )]);
        let mut seen = HashSet::new();
        dispatch_tx(ChainKind::Evm, &tx, &[unrelated], &mut seen, GatewayMetrics::global());
        assert!(unrelated_sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn at_most_once_per_match_key_within_cycle() {
        let (snap, sink) = snapshot(vec![Interest::new(SUB_ADDR, vec![])]);
        let tx = native_tx(SUB_ADDR, 10);
        let mut seen = HashSet::new();
        dispatch_tx(ChainKind::Evm, &tx, &[snap.clone()], &mut seen, GatewayMetrics::global());
        // Same tx again in the same cycle (adapter duplicate): suppressed.
        dispatch_tx(ChainKind::Evm, &tx, &[snap], &mut seen, GatewayMetrics::global());
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn self_transfer_is_deduplicated_by_key() {
        // Subscribed address on both sides: one frame, not two.
        let (snap, sink) = snapshot(vec![Interest::new(SUB_ADDR, vec![])]);
        let tx = NormalizedTx::native("0xh", Some(SUB_ADDR.into()), SUB_ADDR, U256::one(), 1);
        let mut seen = HashSet::new();
        dispatch_tx(ChainKind::Evm, &tx, &[snap], &mut seen, GatewayMetrics::global());
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn token_match_requires_listed_token() {
        let (with_token, with_token_sink) = snapshot(vec![Interest::new(
            "0xa6ebd7cbdc447c7429a9cc7f78110373f0aa0804",
            vec![TOKEN.into()],
        )]);
        let (without_token, without_token_sink) =
            snapshot(vec![Interest::new("0xa6ebd7cbdc447c7429a9cc7f78110373f0aa0804", vec![])]);

        let mut tx = NormalizedTx::native(
            "0xlog",
            Some("0xa6ebd7cbdc447c7429a9cc7f78110373f0aa0804".into()),
            OTHER,
            U256::one(),
            1000,
        );
        tx.token = Some(TOKEN.into());

        let mut seen = HashSet::new();
        dispatch_tx(
            ChainKind::Evm,
            &tx,
            &[with_token, without_token],
            &mut seen,
            GatewayMetrics::global(),
        );
        let frames = with_token_sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["token"], TOKEN);
        assert_eq!(frames[0]["data"]["tx"]["height"], 1000);
        assert!(without_token_sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn alias_matches_derived_destination() {
        let interest = Interest::new("owner111", vec!["mint111".to_string()])
            .with_aliases(vec!["owner111".into(), "ata111".into()]);
        let (snap, sink) = snapshot(vec![interest]);

        let mut tx = NormalizedTx::native("sig", Some("payer".into()), "ata111", U256::from(25u64), 9);
        tx.token = Some("mint111".into());

        let mut seen = HashSet::new();
        dispatch_tx(ChainKind::Solana, &tx, &[snap], &mut seen, GatewayMetrics::global());
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        // The payload names the subscribed owner, not the token account.
        assert_eq!(frames[0]["data"]["addr"], "owner111");
        assert_eq!(frames[0]["data"]["tx"]["txid"], "sig");
    }

    #[test]
    fn zero_value_never_dispatches() {
        let (snap, sink) = snapshot(vec![Interest::new(SUB_ADDR, vec![])]);
        let tx = native_tx(SUB_ADDR, 0);
        let mut seen = HashSet::new();
        assert_eq!(
            dispatch_tx(ChainKind::Evm, &tx, &[snap], &mut seen, GatewayMetrics::global()),
            0
        );
        assert!(sink.frames.lock().unwrap().is_empty());
    }
}
