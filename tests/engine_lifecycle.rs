//! End-to-end lifecycle scenarios driven through the public engine
//! surface: a mock exchange, an in-memory repository, and a manual
//! clock. Ticks are fired explicitly so every assertion is
//! deterministic.

mod common;

use common::{harness, USER};
use rust_decimal_macros::dec;
use tradeloop::exchange::AdapterError;
use tradeloop::types::{Interval, OrderFilter, OrderPatch, OrderStatus, SplitParams};
use tradeloop::EngineError;

// ─────────────────────────────────────────────────────────
// Entry
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pending_order_cancelled_when_close_exceeds_ceiling() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();

    // Last closed M5 candle one tick above max_entry.
    h.close_candle(Interval::M5, dec!(92001));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason.as_deref(), Some("ceiling"));
    assert!(order.closed_at.is_some());

    // Nothing ever reached the exchange; exactly one notification.
    let state = h.adapter.state();
    assert!(state.market_buys.is_empty());
    assert!(state.limit_sells.is_empty());
    drop(state);
    assert_eq!(h.sink.count(), 1);
}

#[tokio::test]
async fn pending_order_waits_below_trigger() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();

    h.close_candle(Interval::M5, dec!(90500));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.adapter.state().market_buys.is_empty());
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn happy_path_entry_then_take_profit() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();

    // Trigger fires; the buy fills at the scripted spot price.
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(order.executed_price, Some(dec!(91450)));
    assert!(order.executed_at.is_some());
    let tp_order_id = order.tp_order_id.clone().expect("TP installed");

    {
        let state = h.adapter.state();
        assert_eq!(state.market_buys, vec![("BTCUSDC".to_string(), dec!(0.001))]);
        // TP quantity carries the dust buffer: floor(0.001 * 0.999).
        assert_eq!(
            state.limit_sells,
            vec![("BTCUSDC".to_string(), dec!(0.000999), dec!(95000))]
        );
    }

    // The resting sell fills: it vanishes from open orders and the base
    // asset turns into quote.
    h.adapter.drop_open_order("BTCUSDC", &tp_order_id);
    h.adapter.set_balance("BTC", dec!(0));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedTp);
    assert!(order.closed_at.is_some());
    // invariant: execution fields survive the terminal transition
    assert_eq!(order.executed_price, Some(dec!(91450)));

    assert_eq!(h.sink.containing("EXECUTED"), 1);
    assert_eq!(h.sink.containing("CLOSED_TP"), 1);
    assert_eq!(h.sink.count(), 2);
}

#[tokio::test]
async fn market_interval_fires_without_candles() {
    let h = harness().await;
    let mut plan = h.plan();
    plan.entry_interval = Interval::Market;
    let order = h.engine.create_order(plan).await.unwrap();

    // No candles scripted at all: Market entries don't need them.
    h.fund(dec!(1000), dec!(91000));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
}

// ─────────────────────────────────────────────────────────
// Stop-loss
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_loss_close_cancels_tp_and_sells() {
    let h = harness().await;
    let mut plan = h.plan();
    plan.stop_interval = Interval::Daily;
    let order = h.engine.create_order(plan).await.unwrap();

    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;
    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
    let tp_order_id = order.tp_order_id.clone().unwrap();

    // A Daily candle closes below the stop.
    h.close_candle(Interval::Daily, dec!(89999));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedSl);

    let state = h.adapter.state();
    // TP came down first, then the wallet balance was sold.
    assert!(state.cancels.contains(&("BTCUSDC".to_string(), tp_order_id)));
    assert_eq!(state.market_sells.len(), 1);
    assert_eq!(state.market_sells[0].1, dec!(0.001));
}

#[tokio::test]
async fn stop_loss_exactly_at_close_hits() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();

    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;

    // close == stop_loss must hit
    h.close_candle(Interval::M5, dec!(90000));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ClosedSl);
}

// ─────────────────────────────────────────────────────────
// Error policies
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limited_tick_is_a_noop() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));

    h.adapter.fail_next(
        "last_closed_candle",
        AdapterError::RateLimited { retry_after: None },
    );
    h.engine.run_tick_once().await;

    // Restored, no error surfaced, no notification.
    let order_now = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order_now.status, OrderStatus::Pending);
    assert_eq!(h.sink.count(), 0);

    // Next tick proceeds normally.
    h.engine.run_tick_once().await;
    let order_now = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order_now.status, OrderStatus::Executed);
}

#[tokio::test]
async fn transient_buy_failure_retries_next_tick() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));

    h.adapter.fail_next(
        "place_market_buy",
        AdapterError::Transient("502".to_string()),
    );
    h.engine.run_tick_once().await;
    assert_eq!(
        h.engine.get_order(order.id).await.unwrap().status,
        OrderStatus::Pending
    );

    h.engine.run_tick_once().await;
    assert_eq!(
        h.engine.get_order(order.id).await.unwrap().status,
        OrderStatus::Executed
    );
}

#[tokio::test]
async fn insufficient_balance_stays_pending_and_notifies_once() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    // Needs ~91.5 quote; wallet has 5.
    h.fund(dec!(5), dec!(91450));

    h.engine.run_tick_once().await;
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    // Cooldown: two ticks, one notification.
    assert_eq!(h.sink.containing("insufficient"), 1);
}

#[tokio::test]
async fn auth_rejection_cancels_pending_and_pauses_credentials() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));

    h.adapter
        .fail_next("place_market_buy", AdapterError::Auth("bad key".to_string()));
    h.engine.run_tick_once().await;

    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason.as_deref(), Some("auth"));

    // Anything else on the same credentials is skipped, not acted on,
    // until the user rotates keys.
    let second = h.engine.create_order(h.plan()).await.unwrap();
    h.engine.run_tick_once().await;
    let second = h.engine.get_order(second.id).await.unwrap();
    assert_eq!(second.status, OrderStatus::Pending);
    assert!(h.adapter.state().market_buys.is_empty());

    let cancelled = h
        .engine
        .get_orders(&OrderFilter {
            status: Some(OrderStatus::Cancelled),
            ..OrderFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
}

#[tokio::test]
async fn second_filter_violation_cancels_the_plan() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));

    h.adapter.fail_next(
        "place_market_buy",
        AdapterError::FilterViolation("LOT_SIZE".to_string()),
    );
    h.engine.run_tick_once().await;
    // First strike: metadata evicted, plan stays pending.
    assert_eq!(
        h.engine.get_order(order.id).await.unwrap().status,
        OrderStatus::Pending
    );
    assert!(h.filters.lookup("mock", "BTCUSDC").is_none());

    h.adapter.fail_next(
        "place_market_buy",
        AdapterError::FilterViolation("LOT_SIZE".to_string()),
    );
    h.engine.run_tick_once().await;
    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason.as_deref(), Some("filter"));
}

// ─────────────────────────────────────────────────────────
// User operations
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn user_cancel_and_invalid_states() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();

    let cancelled = h.engine.cancel_order(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("user"));

    // Terminal orders reject everything.
    assert!(matches!(
        h.engine.cancel_order(order.id).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine
            .update_order(
                order.id,
                OrderPatch {
                    max_entry: Some(dec!(93000)),
                    ..OrderPatch::default()
                }
            )
            .await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine.close_position(order.id).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn create_order_rejects_invariant_violations() {
    let h = harness().await;

    let mut plan = h.plan();
    plan.max_entry = dec!(90000); // below entry
    assert!(matches!(
        h.engine.create_order(plan).await,
        Err(EngineError::Validation(_))
    ));

    let mut plan = h.plan();
    plan.stop_loss = Some(dec!(91000)); // not below entry
    assert!(matches!(
        h.engine.create_order(plan).await,
        Err(EngineError::Validation(_))
    ));

    let mut plan = h.plan();
    plan.stop_interval = Interval::Market; // SL needs a candle interval
    assert!(matches!(
        h.engine.create_order(plan).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn manual_close_sells_wallet_and_finishes_manual() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;

    let closed = h.engine.close_position(order.id).await.unwrap();
    assert_eq!(closed.status, OrderStatus::ClosedManual);
    let state = h.adapter.state();
    assert_eq!(state.market_sells.len(), 1);
    // TP cancelled before selling
    assert_eq!(state.cancels.len(), 1);
}

#[tokio::test]
async fn tp_edit_repegs_resting_order() {
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

    let patch = OrderPatch {
        take_profit: Some(Some(dec!(96000))),
        ..OrderPatch::default()
    };
    let updated = h.engine.update_order(order.id, patch.clone()).await.unwrap();
    assert_eq!(updated.status, OrderStatus::Executed);
    assert_eq!(updated.take_profit, Some(dec!(96000)));
    let new_tp = updated.tp_order_id.clone().unwrap();
    assert_ne!(new_tp, old_tp);

    // Old order cancelled; exactly one resting sell remains, at the new
    // price.
    {
        let state = h.adapter.state();
        assert!(state.cancels.contains(&("BTCUSDC".to_string(), old_tp)));
        let open = state.open_orders.get("BTCUSDC").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].price, dec!(96000));
    }

    // Idempotence: the same edit again changes nothing at the exchange.
    let again = h.engine.update_order(order.id, patch).await.unwrap();
    assert_eq!(again.tp_order_id, Some(new_tp));
    let state = h.adapter.state();
    assert_eq!(state.open_orders.get("BTCUSDC").unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_tp_edit_leaves_old_order_live() {
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

    // Raise the exchange minimums so the new TP cannot be placed, and
    // drop the cached metadata so the edit sees the new filters.
    h.adapter.set_filters(
        "BTCUSDC",
        tradeloop::exchange::SymbolFilters {
            lot_step: dec!(0.000001),
            tick_size: dec!(0.01),
            min_notional: dec!(1000000),
        },
    );
    h.filters.evict("mock", "BTCUSDC");

    let patch = OrderPatch {
        take_profit: Some(Some(dec!(96000))),
        ..OrderPatch::default()
    };
    assert!(matches!(
        h.engine.update_order(order.id, patch).await,
        Err(EngineError::Validation(_))
    ));

    // Old TP untouched, order back to EXECUTED with the old fields.
    let order = h.engine.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(order.take_profit, Some(dec!(95000)));
    assert_eq!(order.tp_order_id, Some(old_tp.clone()));
    let state = h.adapter.state();
    let open = state.open_orders.get("BTCUSDC").unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order_id, old_tp);
}

#[tokio::test]
async fn split_carves_two_executed_orders() {
    let h = harness().await;
    let order = h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(91500));
    h.fund(dec!(1000), dec!(91450));
    h.engine.run_tick_once().await;

    let (kept, carved) = h
        .engine
        .split_order(
            order.id,
            SplitParams {
                split_qty: dec!(0.0004),
                tp1: Some(dec!(95000)),
                sl1: Some(dec!(90000)),
                tp2: Some(dec!(99000)),
                sl2: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(kept.id, order.id);
    assert_eq!(kept.status, OrderStatus::Executed);
    assert_eq!(kept.quantity, dec!(0.0006));
    assert_eq!(carved.status, OrderStatus::Executed);
    assert_eq!(carved.quantity, dec!(0.0004));
    assert_eq!(carved.executed_price, kept.executed_price);
    assert_eq!(carved.take_profit, Some(dec!(99000)));

    // Both legs have their own resting sell.
    let state = h.adapter.state();
    let open = state.open_orders.get("BTCUSDC").unwrap();
    assert_eq!(open.len(), 2);
    assert!(kept.tp_order_id.is_some());
    assert!(carved.tp_order_id.is_some());
    assert_ne!(kept.tp_order_id, carved.tp_order_id);
}

#[tokio::test]
async fn user_id_rides_along_on_notifications() {
    let h = harness().await;
    h.engine.create_order(h.plan()).await.unwrap();
    h.close_candle(Interval::M5, dec!(92001));
    h.engine.run_tick_once().await;

    let messages = h.sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, USER);
    assert!(messages[0].1.contains("BTCUSDC"));
}
