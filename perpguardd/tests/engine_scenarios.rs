//! End-to-end engine scenarios against the stub exchange.
//!
//! Each test wires a full [`Daemon`] with an in-memory journal and drives
//! its loops directly, except where a test runs concurrent writers on a
//! multi-threaded runtime or both loops on their own schedules.

use std::sync::Arc;
use std::time::Duration;

use perpguard_domain::{PositionPatch, Price, Quantity, Side, Signal, Symbol, TrailingPhase};
use perpguard_exec::{ExchangeErrorCode, ExchangePosition, Operation, StubGateway};
use perpguard_store::MemoryJournal;
use perpguardd::{Config, Daemon, EngineEvent, StaticSignalSource};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

fn btc() -> Symbol {
    Symbol::from_pair("BTCUSDT").unwrap()
}

fn eth() -> Symbol {
    Symbol::from_pair("ETHUSDT").unwrap()
}

fn long_signal(symbol: Symbol, confidence: Decimal) -> Signal {
    Signal::new(symbol, Side::Long, confidence).unwrap()
}

fn daemon_with(gateway: Arc<StubGateway>, signals: Vec<Signal>) -> Daemon {
    Daemon::new(
        Config::test(),
        gateway,
        Arc::new(MemoryJournal::new()),
        Arc::new(StaticSignalSource::new(signals)),
    )
    .unwrap()
}

fn stub() -> Arc<StubGateway> {
    let gateway = Arc::new(StubGateway::new(dec!(1000)));
    gateway.set_price(&btc(), dec!(45000));
    gateway.set_price(&eth(), dec!(3000));
    gateway
}

fn remote(symbol: Symbol, entry: Decimal, quantity: Decimal, stop: Decimal) -> ExchangePosition {
    ExchangePosition {
        symbol,
        side: Side::Long,
        entry_price: Price::new(entry).unwrap(),
        quantity: Quantity::new(quantity).unwrap(),
        mark_price: Price::new(entry).unwrap(),
        leverage: None,
        margin: None,
        stop_price: Some(Price::new(stop).unwrap()),
        take_profit_price: None,
    }
}

#[tokio::test]
async fn test_allocation_ceiling_rejects_overexposure() {
    let daemon = daemon_with(stub(), vec![]);
    daemon.slow_cycle().sync_balance().await.unwrap();
    let ledger = daemon.ledger();

    assert!(ledger.allocate(dec!(200), "first"));
    let before = ledger.snapshot();
    assert_eq!(before.available, dec!(600));

    assert!(!ledger.allocate(dec!(700), "second"));
    let after = ledger.snapshot();
    assert_eq!(after.allocated, dec!(200));
    assert_eq!(after.available, dec!(600));
    assert_eq!(after.overexposure_prevented, 1);
}

#[tokio::test]
async fn test_trailing_activates_and_moves_exchange_stop() {
    let gateway = stub();
    let daemon = daemon_with(gateway.clone(), vec![long_signal(btc(), dec!(0.9))]);
    daemon.slow_cycle().sync_balance().await.unwrap();

    let report = daemon.slow_cycle().run_cycle(&CancellationToken::new()).await;
    assert_eq!(report.opened, 1);
    assert_eq!(
        gateway.position(&btc()).unwrap().stop_price.unwrap().as_decimal(),
        dec!(44100)
    );

    // +10% at 8x is +80% ROE
    gateway.set_price(&btc(), dec!(49500));
    daemon.cache().invalidate_ticker(&btc());
    let tick = daemon.fast_loop().tick().await;
    assert_eq!(tick.trailed, 1);

    let position = daemon.store().find_open_by_symbol(&btc(), Side::Long).unwrap();
    assert_eq!(position.trailing.phase, TrailingPhase::Active);
    assert_eq!(
        position.trailing.current_stop_level.unwrap().as_decimal(),
        dec!(48937.5)
    );
    assert_eq!(position.protective_stop_price.unwrap().as_decimal(), dec!(48937.5));
    assert_eq!(
        gateway.position(&btc()).unwrap().stop_price.unwrap().as_decimal(),
        dec!(48937.5)
    );
}

#[tokio::test]
async fn test_unprotectable_position_is_closed_once() {
    let gateway = stub();
    gateway.fail_always(Operation::SetStop, ExchangeErrorCode::StopTooClose);
    let daemon = daemon_with(gateway.clone(), vec![long_signal(btc(), dec!(0.9))]);
    let mut events = daemon.event_bus().subscribe();
    daemon.slow_cycle().sync_balance().await.unwrap();

    let report = daemon.slow_cycle().run_cycle(&CancellationToken::new()).await;
    assert_eq!(report.opened, 1);

    // A sweep after the close finds nothing left to close
    daemon.safety().sweep(None).await;

    let emergencies = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::EmergencyClosure { .. }))
        .count();
    assert_eq!(emergencies, 1);
    assert!(gateway.position(&btc()).is_none());
    assert!(daemon.store().list_live().is_empty());
    assert_eq!(daemon.ledger().snapshot().allocated, dec!(0));
}

#[tokio::test]
async fn test_repeated_ticker_reads_hit_exchange_once() {
    let gateway = stub();
    let daemon = daemon_with(gateway.clone(), vec![]);

    let first = daemon.cache().get_ticker(&btc()).await.unwrap();
    let second = daemon.cache().get_ticker(&btc()).await.unwrap();

    assert!(first.is_fresh() && second.is_fresh());
    assert_eq!(first.value.price, second.value.price);
    assert_eq!(gateway.calls(Operation::GetTicker), 1);
}

#[tokio::test]
async fn test_reconciliation_replay_is_idempotent() {
    let gateway = stub();
    gateway.insert_position(remote(btc(), dec!(45000), dec!(0.01), dec!(44000)));
    gateway.insert_position(remote(eth(), dec!(3000), dec!(0.1), dec!(2900)));
    let daemon = daemon_with(gateway, vec![]);
    daemon.slow_cycle().sync_balance().await.unwrap();

    let first = daemon.slow_cycle().reconcile().await.unwrap();
    let mut ids: Vec<_> = daemon.store().list_live().into_iter().map(|p| p.id).collect();
    ids.sort();
    let allocated = daemon.ledger().snapshot().allocated;

    for _ in 0..3 {
        daemon.cache().invalidate_positions();
        let replay = daemon.slow_cycle().reconcile().await.unwrap();
        assert_eq!(replay.imported, 0);
        assert_eq!(replay.externally_closed, 0);
    }

    let mut replayed: Vec<_> = daemon.store().list_live().into_iter().map(|p| p.id).collect();
    replayed.sort();
    assert_eq!(first.imported, 2);
    assert_eq!(ids, replayed);
    assert_eq!(daemon.ledger().snapshot().allocated, allocated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disjoint_updates_are_both_kept() {
    let gateway = stub();
    gateway.insert_position(remote(btc(), dec!(45000), dec!(0.01), dec!(44000)));
    let daemon = daemon_with(gateway, vec![]);
    daemon.slow_cycle().sync_balance().await.unwrap();
    daemon.slow_cycle().reconcile().await.unwrap();
    let id = daemon.store().list_live()[0].id;
    let start = Arc::new(Barrier::new(2));

    let prices = {
        let store = daemon.store().clone();
        let start = start.clone();
        tokio::spawn(async move {
            start.wait().await;
            for step in 1..=200u32 {
                let price = Price::new(dec!(45000) + Decimal::from(step)).unwrap();
                store.compound_update(id, &PositionPatch::price(price)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let stops = {
        let store = daemon.store().clone();
        let start = start.clone();
        tokio::spawn(async move {
            start.wait().await;
            for step in 1..=200u32 {
                let stop = Price::new(dec!(44000) + Decimal::from(step)).unwrap();
                store.compound_update(id, &PositionPatch::stop(stop, None)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    prices.await.unwrap();
    stops.await.unwrap();

    let position = daemon.store().get(id).unwrap();
    assert_eq!(position.current_price.as_decimal(), dec!(45200));
    assert_eq!(position.protective_stop_price.unwrap().as_decimal(), dec!(44200));
}

#[tokio::test]
async fn test_both_loops_run_and_shut_down_cleanly() {
    let gateway = stub();
    let daemon = Arc::new(daemon_with(
        gateway.clone(),
        vec![long_signal(btc(), dec!(0.9)), long_signal(eth(), dec!(0.7))],
    ));
    daemon.restore().await.unwrap();

    let shutdown = CancellationToken::new();
    let running = {
        let daemon = daemon.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { daemon.run_until(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(800)).await;
    gateway.set_price(&btc(), dec!(45500));
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    let live = daemon.store().list_live();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|p| p.protective_stop_price.is_some()));
    let committed: Decimal = live.iter().map(|p| p.margin_committed).sum();
    let snapshot = daemon.ledger().snapshot();
    assert_eq!(snapshot.allocated, committed);
    assert_eq!(snapshot.reserved, dec!(0));
    assert!(snapshot.allocated <= snapshot.total * dec!(0.8));
    assert!(daemon.metrics().event_count("position_opened") >= 2);
}
