//! Subscription table and contract interest invariants: caps, duplicate
//! rejection, tombstone lifecycle, and the sweeper's reclaim window.

mod common;

use chaingate::subscriptions::{
    ConnId, ContractInterestSet, EventKind, Interest, SubscriptionTable, TOMBSTONE_RECLAIM_AFTER,
};
use chaingate::errors::SubscribeError;
use chaingate::types::{ChainKind, MAX_SUBS, MAX_TRACKED_CONTRACTS};
use common::mocks::CapturingSink;

#[tokio::test]
async fn capacity_cap_rejects_entry_10_001() {
    let table = SubscriptionTable::new(ChainKind::Evm);
    let sink = CapturingSink::arc();
    for i in 0..MAX_SUBS {
        table
            .add_sub(
                ConnId::mint(),
                EventKind::SubscribeAccount,
                sink.clone(),
                vec![Interest::new(format!("0x{:040x}", i), vec![])],
            )
            .await
            .unwrap();
    }
    assert_eq!(table.live_count().await, MAX_SUBS);

    let err = table
        .add_sub(
            ConnId::mint(),
            EventKind::SubscribeAccount,
            sink,
            vec![Interest::new("0xoverflow", vec![])],
        )
        .await
        .unwrap_err();
    assert_eq!(err, SubscribeError::CapacityExceeded);
    assert_eq!(table.live_count().await, MAX_SUBS);
}

#[tokio::test]
async fn same_connection_extends_interests_not_entries() {
    let table = SubscriptionTable::new(ChainKind::Evm);
    let sink = CapturingSink::arc();
    let cid = ConnId::mint();
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink.clone(), vec![Interest::new("0xaa", vec![])])
        .await
        .unwrap();
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink, vec![Interest::new("0xbb", vec![])])
        .await
        .unwrap();

    assert_eq!(table.live_count().await, 1);
    let interests = table.cid_interests(cid, EventKind::SubscribeAccount).await.unwrap();
    let addresses: Vec<&str> = interests.iter().map(|i| i.address.as_str()).collect();
    assert_eq!(addresses, vec!["0xaa", "0xbb"]);
}

#[tokio::test]
async fn duplicate_address_keeps_first_subscription_alive() {
    let table = SubscriptionTable::new(ChainKind::Evm);
    let sink = CapturingSink::arc();
    let cid = ConnId::mint();
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink.clone(), vec![Interest::new("0xaa", vec![])])
        .await
        .unwrap();

    let err = table
        .add_sub(cid, EventKind::SubscribeAccount, sink, vec![Interest::new("0xaa", vec!["0xtok".into()])])
        .await
        .unwrap_err();
    assert_eq!(err, SubscribeError::AlreadySubscribed("0xaa".into()));

    // The original interest is untouched.
    let interests = table.cid_interests(cid, EventKind::SubscribeAccount).await.unwrap();
    assert_eq!(interests.len(), 1);
    assert!(interests[0].tokens.is_empty());
}

#[tokio::test]
async fn another_connection_may_watch_the_same_address() {
    let table = SubscriptionTable::new(ChainKind::Evm);
    let sink = CapturingSink::arc();
    table
        .add_sub(ConnId::mint(), EventKind::SubscribeAccount, sink.clone(), vec![Interest::new("0xaa", vec![])])
        .await
        .unwrap();
    table
        .add_sub(ConnId::mint(), EventKind::SubscribeAccount, sink, vec![Interest::new("0xaa", vec![])])
        .await
        .unwrap();
    assert_eq!(table.live_count().await, 2);
}

#[tokio::test]
async fn sweeper_reclaims_after_the_grace_window() {
    let table = SubscriptionTable::new(ChainKind::Evm);
    let sink = CapturingSink::arc();
    let cid = ConnId::mint();
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink.clone(), vec![Interest::new("0xaa", vec![])])
        .await
        .unwrap();
    table.close_cid(cid).await;

    // Inside the grace window the tombstone must survive, and it keeps
    // swallowing late add_sub calls from the closing connection.
    assert_eq!(table.sweep().await, 0);
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink.clone(), vec![Interest::new("0xbb", vec![])])
        .await
        .unwrap();
    assert_eq!(table.live_count().await, 0);

    tokio::time::sleep(TOMBSTONE_RECLAIM_AFTER + std::time::Duration::from_millis(200)).await;
    assert_eq!(table.sweep().await, 1);

    // After reclaim the same connection id would be a fresh row again.
    table
        .add_sub(cid, EventKind::SubscribeAccount, sink, vec![Interest::new("0xcc", vec![])])
        .await
        .unwrap();
    assert_eq!(table.live_count().await, 1);
}

#[tokio::test]
async fn contract_interest_cap_is_a_silent_no_op() {
    let set = ContractInterestSet::new(ChainKind::Evm);
    for i in 0..MAX_TRACKED_CONTRACTS {
        assert!(set.insert(&format!("0x{:040x}", i)).await, "token {} should insert", i);
    }
    // The 51st distinct token is dropped without error.
    assert!(!set.insert("0xffffffffffffffffffffffffffffffffffffffff").await);
    assert_eq!(set.len().await, MAX_TRACKED_CONTRACTS);
    // Existing entries are unaffected.
    for i in 0..MAX_TRACKED_CONTRACTS {
        assert!(set.contains(&format!("0x{:040x}", i)).await);
    }
    // Re-inserting an existing member is not an install signal either.
    assert!(!set.insert(&format!("0x{:040x}", 0)).await);
}
