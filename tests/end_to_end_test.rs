/// End-to-end sync tests
///
/// A `SyncManager` drives a queue-fronted worker over a scripted adapter and
/// the certified store is checked after each polling interval.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use wallet_sync::store::cache::load;
use wallet_sync::{
    Balance, CertifiedData, Chain, KeyState, MemoryCache, PersistentCache, StoreUpdate,
    SyncConfig, SyncManager, TransactionStatus, WorkerEvent,
};

const INTERVAL: Duration = Duration::from_millis(30_000);

fn manager() -> SyncManager {
    init_logger();
    SyncManager::new(SyncConfig {
        polling_interval: INTERVAL,
        ..SyncConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_uncertified_then_certified_balance_ends_certified() {
    let manager = manager();
    let token = btc_token();
    let mut updates = manager.store().subscribe();

    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_balance(Ok(CertifiedData::uncertified(Balance(100_000_000))));
    adapter.push_balance(Ok(CertifiedData::certified(Balance(100_000_000))));

    manager.watch(token.clone(), btc_address(), adapter.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::uncertified(Balance(100_000_000)))
    );
    assert_eq!(manager.store().key_state(token.id()), KeyState::Uncertified);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::certified(Balance(100_000_000)))
    );
    assert_eq!(manager.store().key_state(token.id()), KeyState::Certified);

    assert_eq!(
        updates.recv().await.unwrap(),
        StoreUpdate::Balance {
            token: token.id().clone(),
            balance: CertifiedData::uncertified(Balance(100_000_000)),
        }
    );
    assert_eq!(
        updates.recv().await.unwrap(),
        StoreUpdate::Balance {
            token: token.id().clone(),
            balance: CertifiedData::certified(Balance(100_000_000)),
        }
    );

    manager.shutdown().await;
    assert!(manager.watched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_uncertified_read_does_not_demote_store() {
    let manager = manager();
    let token = btc_token();

    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_balance(Ok(CertifiedData::certified(Balance(7))));
    adapter.push_balance(Ok(CertifiedData::uncertified(Balance(9))));
    manager.watch(token.clone(), btc_address(), adapter).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::time::sleep(INTERVAL).await;

    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::certified(Balance(7)))
    );
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unwatch_stops_updates() {
    let manager = manager();
    let token = btc_token();

    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_balance(Ok(CertifiedData::uncertified(Balance(1))));
    manager.watch(token.clone(), btc_address(), adapter.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.is_watching(Chain::Btc, token.id()));

    assert!(manager.unwatch(Chain::Btc, token.id()).await);
    assert!(!manager.unwatch(Chain::Btc, token.id()).await);
    let calls = adapter.balance_calls();

    adapter.push_balance(Ok(CertifiedData::uncertified(Balance(2))));
    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(adapter.balance_calls(), calls);
    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::uncertified(Balance(1)))
    );
    assert!(manager.trigger(Chain::Btc, token.id()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_and_events_flow_through_the_manager() {
    let manager = manager();
    let token = btc_token();
    let mut events = manager.subscribe();

    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_page(Ok(CertifiedData::certified(page(
        vec![tx("a", TransactionStatus::Pending)],
        None,
    ))));
    adapter.push_page(Ok(CertifiedData::certified(page(
        vec![tx("a", TransactionStatus::Confirmed), tx("b", TransactionStatus::Confirmed)],
        None,
    ))));
    manager.watch(token.clone(), btc_address(), adapter.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    manager.trigger(Chain::Btc, token.id()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(adapter.balance_calls(), 2);

    let stored = manager.store().transactions(token.id());
    let summary: Vec<(&str, TransactionStatus, bool)> = stored
        .iter()
        .map(|t| (t.data.id.as_str(), t.data.status, t.certified))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("b", TransactionStatus::Confirmed, true),
            ("a", TransactionStatus::Confirmed, true),
        ]
    );

    let mut synced = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::Synced { .. }) {
            synced += 1;
        }
    }
    assert_eq!(synced, 2);

    manager.sign_out().await;
    assert_eq!(manager.store().key_state(token.id()), KeyState::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_results_are_persisted_and_warm_the_next_session() {
    init_logger();
    let cache = Arc::new(MemoryCache::new());
    let token = btc_token();

    let first = SyncManager::new(SyncConfig::default()).with_cache(cache.clone());
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_balance(Ok(CertifiedData::certified(Balance(100_000_000))));
    first.watch(token.clone(), btc_address(), adapter).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.shutdown().await;

    let cached: Option<serde_json::Value> = load(cache.as_ref(), "store:BTC-mainnet").unwrap();
    assert_eq!(cached.unwrap()["balance"], "100000000");

    // A new session starts from the cached value, uncertified until re-read.
    let second = SyncManager::new(SyncConfig::default()).with_cache(cache.clone());
    let slow = Arc::new(ScriptedAdapter::new().with_delay(Duration::from_secs(5)));
    slow.push_balance(Ok(CertifiedData::certified(Balance(100_000_000))));
    second.watch(token.clone(), btc_address(), slow).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        second.store().balance(token.id()),
        Some(CertifiedData::uncertified(Balance(100_000_000)))
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(second.store().key_state(token.id()), KeyState::Certified);
    second.shutdown().await;
    assert!(cache.get("store:BTC-mainnet").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_address_change_clears_entries_of_the_previous_address() {
    init_logger();
    let cache = Arc::new(MemoryCache::new());
    let manager = SyncManager::new(SyncConfig {
        polling_interval: INTERVAL,
        ..SyncConfig::default()
    })
    .with_cache(cache.clone());
    let token = btc_token();

    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.push_balance(Ok(CertifiedData::certified(Balance(7))));
    adapter.push_balance(Ok(CertifiedData::uncertified(Balance(9))));
    adapter.push_page(Ok(CertifiedData::certified(page(
        vec![tx("a", TransactionStatus::Confirmed)],
        None,
    ))));
    adapter.push_page(Ok(CertifiedData::uncertified(page(
        vec![tx("b", TransactionStatus::Pending)],
        None,
    ))));

    manager.watch(token.clone(), btc_address(), adapter.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::certified(Balance(7)))
    );

    manager.watch(token.clone(), second_btc_address(), adapter).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        manager.store().balance(token.id()),
        Some(CertifiedData::uncertified(Balance(9)))
    );
    let ids: Vec<String> = manager
        .store()
        .transactions(token.id())
        .into_iter()
        .map(|t| t.data.id)
        .collect();
    assert_eq!(ids, vec!["b"]);

    let cached: Option<serde_json::Value> = load(cache.as_ref(), "store:BTC-mainnet").unwrap();
    assert_eq!(cached.unwrap()["balance"], "9");

    manager.shutdown().await;
}
