//! Reconciliation scenarios: crashed workers, externally cancelled TPs,
//! and positions sold behind the engine's back. The harness forces
//! orders into IN_EXECUTION through the repository to simulate a worker
//! dying mid-flight.

mod common;

use chrono::Duration as ChronoDuration;
use common::{harness, t0, Harness};
use rust_decimal_macros::dec;
use tradeloop::store::TransitionPatch;
use tradeloop::types::{Interval, Order, OrderStatus};

/// Put an order into IN_EXECUTION as if a worker took it two minutes
/// ago and died.
async fn wedge(h: &Harness, order: &Order, from: OrderStatus) {
    h.repo
        .atomic_transition(
            order.id,
            from,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            t0() - ChronoDuration::seconds(120),
        )
        .await
        .expect("wedge order");
}

#[tokio::test]
async fn crash_between_buy_and_commit_recovers_to_executed() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    wedge(&h, &order, OrderStatus::Pending).await;

    // The buy actually landed before the crash: the wallet holds the
    // base asset, but no execution state was recorded.
    h.adapter.set_balance("BTC", dec!(0.001));
    h.fund(dec!(900), dec!(91450));

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
    // Fill price was lost with the worker; current price stands in.
    assert_eq!(order.executed_price, Some(dec!(91450)));
    assert!(order.executed_at.is_some());
    assert_eq!(h.sink.containing("recovered"), 1);

    // The next engine tick installs the missing TP.
    h.close_candle(Interval::M5, dec!(91500));
    h.engine.run_tick_once().await;
    let order = h.engine.get_order(order.id).await.unwrap();
    assert!(order.tp_order_id.is_some());
    let state = h.adapter.state();
    assert_eq!(state.limit_sells.len(), 1);
    assert_eq!(state.limit_sells[0].2, dec!(95000));
}

#[tokio::test]
async fn crash_before_buy_restores_to_pending() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    wedge(&h, &order, OrderStatus::Pending).await;

    // No base asset arrived: the buy never happened.
    h.adapter.set_balance("BTC", dec!(0));

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.executed_at.is_none());
}

#[tokio::test]
async fn fresh_in_execution_is_left_alone() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    // Taken *now*, not stale: some worker is legitimately on it.
    h.repo
        .atomic_transition(
            order.id,
            OrderStatus::Pending,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            t0(),
        )
        .await
        .unwrap();

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::InExecution);
}

#[tokio::test]
async fn stale_executed_with_empty_wallet_closes_externally() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;

    wedge(&h, &h.engine.get_order(order.id).await.unwrap(), OrderStatus::Executed).await;
    h.adapter.set_balance("BTC", dec!(0));

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedExternally);
    // invariant: execution state survives the terminal transition
    assert_eq!(order.executed_price, Some(dec!(91450)));
}

#[tokio::test]
async fn externally_cancelled_tp_is_reinstalled() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;
    let old_tp = h
        .engine
        .get_order(order.id)
        .await
        .unwrap()
        .tp_order_id
        .unwrap();

    // The user cancels the TP on the exchange UI; the position remains.
    h.adapter.drop_open_order("BTCUSDC", &old_tp);

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
    let new_tp = order.tp_order_id.clone().unwrap();
    assert_ne!(new_tp, old_tp);
    assert_eq!(h.sink.containing("re-installed"), 1);

    let state = h.adapter.state();
    let open = state.open_orders.get("BTCUSDC").unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, dec!(95000));
}

#[tokio::test]
async fn missing_tp_with_empty_wallet_confirms_fill() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;
    let tp = h
        .engine
        .get_order(order.id)
        .await
        .unwrap()
        .tp_order_id
        .unwrap();

    // TP vanished and so did the base asset: that was a fill.
    h.adapter.drop_open_order("BTCUSDC", &tp);
    h.adapter.set_balance("BTC", dec!(0));

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedTp);
}

#[tokio::test]
async fn manual_sell_with_live_tp_closes_externally() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;
    let tp = h
        .engine
        .get_order(order.id)
        .await
        .unwrap()
        .tp_order_id
        .unwrap();

    // The user market-sold the position themselves; our TP still rests.
    h.adapter.set_balance("BTC", dec!(0));

    h.engine.run_reconcile_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedExternally);
    // Best-effort cleanup took the orphaned TP down.
    let state = h.adapter.state();
    assert!(state.cancels.contains(&("BTCUSDC".to_string(), tp)));
    assert_eq!(h.sink.containing("CLOSED_EXTERNALLY"), 1);
}
