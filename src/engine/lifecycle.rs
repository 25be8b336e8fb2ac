//! Per-order tick procedure.
//!
//! Each worker takes the order's critical section (a compare-and-swap to
//! IN_EXECUTION), does its adapter work, and either finishes a
//! transition or restores the prior status. If anything fails between
//! those two writes the order stays IN_EXECUTION and the stale sweep in
//! [`reconcile`](super::reconcile) recovers it — that asymmetry is the
//! rollback discipline, not an accident.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::triggers::{entry_decision, stop_decision, EntryDecision, StopDecision};
use super::EngineCtx;
use crate::engine::notify::transition_message;
use crate::exchange::{AdapterError, ExchangeAdapter, SymbolFilters};
use crate::store::{StoreError, TransitionPatch};
use crate::types::{Order, OrderStatus};

// ─────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────

/// One engine tick for one order. Never panics the tick loop; repository
/// failures mid-flight are logged and left for reconciliation.
pub(crate) async fn process_order(ctx: &EngineCtx, order: Order) {
    let prior = order.status;
    if prior != OrderStatus::Pending && prior != OrderStatus::Executed {
        return;
    }
    // Don't burn the critical section on credentials known to be bad.
    if ctx.registry.is_paused(order.api_key_id).await {
        debug!(order_id = order.id, "credentials paused; skipping");
        return;
    }

    let now = ctx.clock.now();
    let held = match ctx
        .repo
        .atomic_transition(
            order.id,
            prior,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            now,
        )
        .await
    {
        Ok(order) => order,
        Err(StoreError::Conflict { .. }) => {
            debug!(order_id = order.id, "another worker holds the order");
            return;
        }
        Err(err) => {
            warn!(order_id = order.id, "could not take critical section: {err}");
            return;
        }
    };

    let adapter = match ctx.registry.adapter_for(&held).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(order_id = held.id, "no adapter: {err}");
            if let Err(err) = restore_status(ctx, &held, prior).await {
                warn!(order_id = held.id, "restore failed: {err}");
            }
            return;
        }
    };

    let result = match prior {
        OrderStatus::Pending => tick_pending(ctx, adapter.as_ref(), &held).await,
        _ => tick_executed(ctx, adapter.as_ref(), &held).await,
    };
    if let Err(err) = result {
        // Rollback discipline: left IN_EXECUTION for the stale sweep.
        warn!(order_id = held.id, "tick aborted mid-flight: {err}");
    }
}

// ─────────────────────────────────────────────────────────
// PENDING: entry trigger and placement
// ─────────────────────────────────────────────────────────

async fn tick_pending(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
) -> Result<(), StoreError> {
    let now = ctx.clock.now();
    match entry_decision(adapter, order, now).await {
        Err(err) => adapter_failure(ctx, order, OrderStatus::Pending, err, "entry trigger").await,
        Ok(EntryDecision::Wait) => restore_status(ctx, order, OrderStatus::Pending).await,
        Ok(EntryDecision::Cancel) => {
            let closed = ctx
                .repo
                .atomic_transition(
                    order.id,
                    OrderStatus::InExecution,
                    OrderStatus::Cancelled,
                    TransitionPatch::cancelled(now, "ceiling"),
                    now,
                )
                .await?;
            info!(order_id = order.id, symbol = %order.symbol, "🚫 entry ceiling exceeded; plan cancelled");
            clear_strikes(ctx, order.id).await;
            send_note(ctx, &closed, "CANCELLED (market closed above max entry)", None).await;
            Ok(())
        }
        Ok(EntryDecision::Fire) => place_entry(ctx, adapter, order).await,
    }
}

async fn place_entry(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
) -> Result<(), StoreError> {
    let now = ctx.clock.now();

    let filters = match filters_for(ctx, adapter, &order.symbol).await {
        Ok(filters) => filters,
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Pending, err, "filters").await,
    };
    let qty = filters.floor_qty(order.quantity);
    let price = match adapter.spot_price(&order.symbol).await {
        Ok(price) => price,
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Pending, err, "price").await,
    };
    if qty <= Decimal::ZERO || !filters.meets_min_notional(qty, price) {
        // Not cancelled: balance or price may shift in the plan's favor.
        debug!(order_id = order.id, %qty, %price, "below min notional; staying pending");
        return restore_status(ctx, order, OrderStatus::Pending).await;
    }

    let quote = match adapter.balance(order.quote_asset()).await {
        Ok(balance) => balance,
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Pending, err, "balance").await,
    };
    let needed = qty * price * (Decimal::ONE + ctx.cfg.fee_margin);
    if quote.free < needed {
        debug!(order_id = order.id, %needed, free = %quote.free, "quote balance too low");
        notify_insufficient(ctx, order, needed, quote.free).await;
        return restore_status(ctx, order, OrderStatus::Pending).await;
    }

    let placed = match adapter.place_market_buy(&order.symbol, qty).await {
        Ok(placed) => placed,
        Err(AdapterError::InsufficientBalance(msg)) => {
            warn!(order_id = order.id, "buy rejected, insufficient balance: {msg}");
            notify_insufficient(ctx, order, needed, quote.free).await;
            return restore_status(ctx, order, OrderStatus::Pending).await;
        }
        Err(AdapterError::FilterViolation(msg)) => {
            return filter_strike(ctx, adapter, order, msg).await;
        }
        Err(AdapterError::Auth(msg)) => {
            return auth_reject(ctx, order, OrderStatus::Pending, msg).await;
        }
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Pending, err, "buy").await,
    };
    clear_strikes(ctx, order.id).await;

    let executed_price = placed.avg_fill_price.unwrap_or(price);
    let filled_qty = if placed.filled_qty > Decimal::ZERO {
        placed.filled_qty
    } else {
        qty
    };

    let tp_order_id = match order.take_profit {
        Some(tp) => install_tp(ctx, adapter, order, &filters, tp, filled_qty).await,
        None => None,
    };

    let executed = ctx
        .repo
        .atomic_transition(
            order.id,
            OrderStatus::InExecution,
            OrderStatus::Executed,
            TransitionPatch::executed(executed_price, now).with_tp(tp_order_id.clone()),
            now,
        )
        .await?;
    info!(
        order_id = order.id,
        symbol = %order.symbol,
        %executed_price,
        tp_order_id = tp_order_id.as_deref().unwrap_or("-"),
        "✅ entry filled"
    );
    send_note(ctx, &executed, "EXECUTED", Some(executed_price)).await;
    Ok(())
}

/// Place the resting TP limit sell. Returns `None` (and logs) when the
/// TP cannot be placed; the executed tick re-tries installation later.
pub(crate) async fn install_tp(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
    filters: &SymbolFilters,
    take_profit: Decimal,
    filled_qty: Decimal,
) -> Option<String> {
    // The dust buffer absorbs fees paid in base asset so the sell never
    // exceeds what actually landed in the wallet.
    let tp_qty = filters.floor_qty(filled_qty * (Decimal::ONE - ctx.cfg.dust_buffer));
    let tp_price = filters.round_price(take_profit);
    if tp_qty <= Decimal::ZERO || !filters.meets_min_notional(tp_qty, tp_price) {
        warn!(
            order_id = order.id,
            %tp_qty, %tp_price,
            "TP below min notional; running stop-loss only"
        );
        return None;
    }
    match adapter.place_limit_sell(&order.symbol, tp_qty, tp_price).await {
        Ok(placed) => Some(placed.order_id),
        Err(err) => {
            warn!(order_id = order.id, "TP placement failed ({err}); will retry");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────
// EXECUTED: stop-loss, TP upkeep, external interference
// ─────────────────────────────────────────────────────────

async fn tick_executed(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
) -> Result<(), StoreError> {
    let now = ctx.clock.now();

    // Stop-loss first: a trend break outranks everything else.
    if order.stop_loss.is_some() {
        match stop_decision(adapter, order, now).await {
            Err(err) => {
                return adapter_failure(ctx, order, OrderStatus::Executed, err, "stop trigger")
                    .await
            }
            Ok(StopDecision::Hit) => {
                info!(order_id = order.id, symbol = %order.symbol, "📉 stop-loss hit");
                return close_at_market(ctx, adapter, order, OrderStatus::ClosedSl, "CLOSED_SL")
                    .await;
            }
            Ok(StopDecision::Ok) => {}
        }
    }

    // TP upkeep: a plan with a take-profit but no resting order (failed
    // install, crash recovery) gets one placed now.
    if let (Some(take_profit), None) = (order.take_profit, order.tp_order_id.as_ref()) {
        let filters = match filters_for(ctx, adapter, &order.symbol).await {
            Ok(filters) => filters,
            Err(err) => {
                return adapter_failure(ctx, order, OrderStatus::Executed, err, "filters").await
            }
        };
        let tp_order_id =
            install_tp(ctx, adapter, order, &filters, take_profit, order.quantity).await;
        if let Some(id) = tp_order_id.as_deref() {
            info!(order_id = order.id, tp_order_id = id, "TP installed");
        }
        ctx.repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Executed,
                TransitionPatch::none().with_tp(tp_order_id),
                now,
            )
            .await?;
        return Ok(());
    }

    // TP fill: the resting sell vanished from the open-order list. The
    // slow sweep disambiguates fills from external cancels for orders it
    // reaches first; here a missing TP counts as filled.
    if let Some(tp_order_id) = order.tp_order_id.as_deref() {
        let open = match adapter.list_open_orders(&order.symbol).await {
            Ok(open) => open,
            Err(err) => {
                return adapter_failure(ctx, order, OrderStatus::Executed, err, "open orders")
                    .await
            }
        };
        if !open.iter().any(|o| o.order_id == tp_order_id) {
            let closed = ctx
                .repo
                .atomic_transition(
                    order.id,
                    OrderStatus::InExecution,
                    OrderStatus::ClosedTp,
                    TransitionPatch::closed(now),
                    now,
                )
                .await?;
            info!(order_id = order.id, symbol = %order.symbol, "🎯 take-profit filled");
            send_note(ctx, &closed, "CLOSED_TP", order.take_profit).await;
            return Ok(());
        }
    }

    // External sell: the wallet no longer holds the position. Locked
    // balance counts — a live TP keeps the base asset locked, not free.
    let base = match adapter.balance(order.base_asset()).await {
        Ok(balance) => balance,
        Err(err) => {
            return adapter_failure(ctx, order, OrderStatus::Executed, err, "base balance").await
        }
    };
    let held = base.free + base.locked;
    let expected = order.quantity * (Decimal::ONE - ctx.cfg.dust_buffer);
    if held < expected {
        if let Some(tp_order_id) = order.tp_order_id.as_deref() {
            if let Err(err) = adapter.cancel_order(&order.symbol, tp_order_id).await {
                warn!(order_id = order.id, "best-effort TP cancel failed: {err}");
            }
        }
        let closed = ctx
            .repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::ClosedExternally,
                TransitionPatch::closed(now),
                now,
            )
            .await?;
        info!(order_id = order.id, symbol = %order.symbol, %held, "position sold outside the engine");
        send_note(ctx, &closed, "CLOSED_EXTERNALLY", None).await;
        return Ok(());
    }

    restore_status(ctx, order, OrderStatus::Executed).await
}

/// Cancel the TP (best effort) and market-sell whatever the wallet
/// holds, then finish on `terminal`. Shared by the stop-loss path and
/// the user-facing close operation.
pub(crate) async fn close_at_market(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
    terminal: OrderStatus,
    label: &str,
) -> Result<(), StoreError> {
    let now = ctx.clock.now();

    if let Some(tp_order_id) = order.tp_order_id.as_deref() {
        // NotFound is already mapped to success; anything else is
        // logged and the close proceeds.
        if let Err(err) = adapter.cancel_order(&order.symbol, tp_order_id).await {
            warn!(order_id = order.id, "TP cancel failed ({err}); proceeding");
        }
    }

    let filters = match filters_for(ctx, adapter, &order.symbol).await {
        Ok(filters) => filters,
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Executed, err, "filters").await,
    };
    let base = match adapter.balance(order.base_asset()).await {
        Ok(balance) => balance,
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Executed, err, "balance").await,
    };

    // Sell what is actually there, never more than the plan's quantity.
    let sell_qty = filters.floor_qty(order.quantity.min(base.free));
    if sell_qty <= Decimal::ZERO {
        let closed = ctx
            .repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::ClosedExternally,
                TransitionPatch::closed(now),
                now,
            )
            .await?;
        info!(order_id = order.id, "nothing left to sell; closing as external");
        send_note(ctx, &closed, "CLOSED_EXTERNALLY", None).await;
        return Ok(());
    }

    let placed = match adapter.place_market_sell(&order.symbol, sell_qty).await {
        Ok(placed) => placed,
        Err(AdapterError::InsufficientBalance(msg)) => {
            // Wallet emptied between the balance read and the sell.
            warn!(order_id = order.id, "sell rejected ({msg}); closing as external");
            let closed = ctx
                .repo
                .atomic_transition(
                    order.id,
                    OrderStatus::InExecution,
                    OrderStatus::ClosedExternally,
                    TransitionPatch::closed(now),
                    now,
                )
                .await?;
            send_note(ctx, &closed, "CLOSED_EXTERNALLY", None).await;
            return Ok(());
        }
        Err(err) => return adapter_failure(ctx, order, OrderStatus::Executed, err, "sell").await,
    };

    let closed = ctx
        .repo
        .atomic_transition(
            order.id,
            OrderStatus::InExecution,
            terminal,
            TransitionPatch::closed(now),
            now,
        )
        .await?;
    info!(order_id = order.id, symbol = %order.symbol, status = label, %sell_qty, "position closed");
    send_note(ctx, &closed, label, placed.avg_fill_price).await;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Shared plumbing
// ─────────────────────────────────────────────────────────

/// Give the critical section back, restoring the pre-tick status.
pub(crate) async fn restore_status(
    ctx: &EngineCtx,
    order: &Order,
    prior: OrderStatus,
) -> Result<(), StoreError> {
    ctx.repo
        .atomic_transition(
            order.id,
            OrderStatus::InExecution,
            prior,
            TransitionPatch::none(),
            ctx.clock.now(),
        )
        .await?;
    Ok(())
}

/// Apply the per-kind error policy for a failed adapter call made while
/// holding the critical section.
async fn adapter_failure(
    ctx: &EngineCtx,
    order: &Order,
    prior: OrderStatus,
    err: AdapterError,
    stage: &str,
) -> Result<(), StoreError> {
    match err {
        err if err.is_retryable() => {
            // Backoff is the tick period; rate limits are not errors.
            debug!(order_id = order.id, stage, "retryable adapter error: {err}");
            restore_status(ctx, order, prior).await
        }
        AdapterError::Auth(msg) => auth_reject(ctx, order, prior, msg).await,
        err => {
            warn!(order_id = order.id, stage, "adapter error: {err}");
            restore_status(ctx, order, prior).await
        }
    }
}

/// Credentials were rejected: pause everything routed through them. A
/// pending plan cancels; a live position stays EXECUTED (the engine has
/// no business abandoning a funded position) and simply stops being
/// acted on until the user rotates keys.
async fn auth_reject(
    ctx: &EngineCtx,
    order: &Order,
    prior: OrderStatus,
    msg: String,
) -> Result<(), StoreError> {
    warn!(order_id = order.id, api_key_id = order.api_key_id, "auth rejected: {msg}");
    ctx.registry.pause(order.api_key_id).await;
    let now = ctx.clock.now();
    if prior == OrderStatus::Pending {
        let closed = ctx
            .repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Cancelled,
                TransitionPatch::cancelled(now, "auth"),
                now,
            )
            .await?;
        send_note(ctx, &closed, "CANCELLED (exchange rejected credentials)", None).await;
    } else {
        restore_status(ctx, order, prior).await?;
        send_note(
            ctx,
            order,
            "paused: exchange rejected credentials; update your API keys",
            None,
        )
        .await;
    }
    Ok(())
}

/// FilterViolation during placement: evict metadata and retry once; a
/// second consecutive violation cancels the plan.
async fn filter_strike(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
    msg: String,
) -> Result<(), StoreError> {
    ctx.filters.evict(adapter.name(), &order.symbol);
    let strikes = {
        let mut strikes = ctx.filter_strikes.lock().await;
        let count = strikes.entry(order.id).or_insert(0);
        *count += 1;
        *count
    };
    if strikes >= 2 {
        let now = ctx.clock.now();
        let closed = ctx
            .repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Cancelled,
                TransitionPatch::cancelled(now, "filter"),
                now,
            )
            .await?;
        clear_strikes(ctx, order.id).await;
        warn!(order_id = order.id, "repeated filter violation: {msg}");
        send_note(ctx, &closed, "CANCELLED (exchange filters rejected the order)", None).await;
        Ok(())
    } else {
        warn!(order_id = order.id, "filter violation ({msg}); metadata evicted, retrying");
        restore_status(ctx, order, OrderStatus::Pending).await
    }
}

pub(crate) async fn clear_strikes(ctx: &EngineCtx, order_id: i64) {
    ctx.filter_strikes.lock().await.remove(&order_id);
}

/// Filters via the process-wide cache, fetching on miss.
pub(crate) async fn filters_for(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    symbol: &str,
) -> Result<SymbolFilters, AdapterError> {
    if let Some(filters) = ctx.filters.lookup(adapter.name(), symbol) {
        return Ok(filters);
    }
    let filters = adapter.symbol_filters(symbol).await?;
    ctx.filters.insert(adapter.name(), symbol, filters);
    Ok(filters)
}

pub(crate) async fn send_note(
    ctx: &EngineCtx,
    order: &Order,
    transition: &str,
    price: Option<Decimal>,
) {
    let message = transition_message(order, transition, price, ctx.clock.now());
    ctx.sink.notify(order.user_id, &message).await;
}

/// Insufficient-balance notifications are throttled to one per user per
/// cooldown window; the log line fires every time.
async fn notify_insufficient(ctx: &EngineCtx, order: &Order, needed: Decimal, free: Decimal) {
    let now = ctx.clock.now();
    let cooldown = chrono::Duration::from_std(ctx.cfg.insufficient_cooldown)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    let due = {
        let mut notified = ctx.balance_notified.lock().await;
        let due = notified
            .get(&order.user_id)
            .map_or(true, |last| now - *last >= cooldown);
        if due {
            notified.insert(order.user_id, now);
        }
        due
    };
    if due {
        let message = format!(
            "order #{} {}: insufficient {} balance (need {}, have {})",
            order.id,
            order.symbol,
            order.quote_asset(),
            needed.round_dp(8).normalize(),
            free.normalize(),
        );
        ctx.sink.notify(order.user_id, &message).await;
    }
}
