//! Reconciliation sweeps.
//!
//! The slow tick looks at the world from the opposite direction of the
//! engine: instead of asking "should this order move", it asks "does the
//! exchange agree with what we stored". Three drifts are corrected:
//! workers that died inside the critical section, TP orders that
//! vanished without a fill, and positions sold behind the engine's back.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::lifecycle::{filters_for, install_tp, restore_status, send_note};
use super::EngineCtx;
use crate::exchange::ExchangeAdapter;
use crate::store::{StoreError, TransitionPatch};
use crate::types::{Order, OrderStatus};

pub(crate) async fn run_sweep(ctx: &EngineCtx) {
    let now = ctx.clock.now();
    let stale_cutoff = now
        - chrono::Duration::from_std(ctx.cfg.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

    // Workers that died inside the critical section.
    let stale = match ctx.repo.stale_in_execution(stale_cutoff).await {
        Ok(stale) => stale,
        Err(err) => {
            warn!("reconciliation skipped, repository unavailable: {err}");
            return;
        }
    };
    for order in stale {
        if ctx.registry.is_paused(order.api_key_id).await {
            continue;
        }
        recover_stale(ctx, order).await;
    }

    // Cross-check every executed position against the exchange.
    let orders = match ctx.repo.list_non_terminal().await {
        Ok(orders) => orders,
        Err(err) => {
            warn!("reconciliation skipped, repository unavailable: {err}");
            return;
        }
    };
    for order in orders {
        if order.status != OrderStatus::Executed {
            continue;
        }
        if ctx.registry.is_paused(order.api_key_id).await {
            continue;
        }
        reconcile_executed(ctx, order).await;
    }
}

// ─────────────────────────────────────────────────────────
// Stale IN_EXECUTION recovery
// ─────────────────────────────────────────────────────────

/// A worker died (or the process was killed) while holding the critical
/// section. The wallet decides what actually happened: if the base
/// asset arrived the buy went through, otherwise the order resumes
/// waiting.
async fn recover_stale(ctx: &EngineCtx, order: Order) {
    let adapter = match ctx.registry.adapter_for(&order).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(order_id = order.id, "stale recovery: no adapter: {err}");
            return;
        }
    };
    let base = match adapter.balance(order.base_asset()).await {
        Ok(balance) => balance,
        Err(err) => {
            warn!(order_id = order.id, "stale recovery: balance unavailable: {err}");
            return;
        }
    };

    let held = base.free + base.locked;
    let expected = order.quantity * (Decimal::ONE - ctx.cfg.dust_buffer);
    let now = ctx.clock.now();

    let result = if held >= expected {
        // The buy landed before the crash. Fill price may be unknown;
        // fall back to the current price as the best available record.
        let price = match order.executed_price {
            Some(price) => price,
            None => match adapter.spot_price(&order.symbol).await {
                Ok(price) => price,
                Err(err) => {
                    warn!(order_id = order.id, "stale recovery: price unavailable: {err}");
                    return;
                }
            },
        };
        let patch = if order.executed_at.is_some() {
            TransitionPatch::none()
        } else {
            TransitionPatch::executed(price, now)
        };
        ctx.repo
            .atomic_transition(order.id, OrderStatus::InExecution, OrderStatus::Executed, patch, now)
            .await
            .map(|recovered| {
                info!(order_id = order.id, %price, "⚕️ stale order recovered as EXECUTED");
                recovered
            })
        // The next engine tick installs the TP if one is due.
    } else if order.executed_at.is_some() {
        // Was executed before the crash, and the base asset is gone:
        // somebody closed it while we were dark.
        ctx.repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::ClosedExternally,
                TransitionPatch::closed(now),
                now,
            )
            .await
            .map(|closed| {
                info!(order_id = order.id, "stale executed order closed externally");
                closed
            })
    } else {
        ctx.repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Pending,
                TransitionPatch::none(),
                now,
            )
            .await
            .map(|restored| {
                info!(order_id = order.id, "⚕️ stale order restored to PENDING");
                restored
            })
    };

    match result {
        Ok(recovered) if recovered.status != OrderStatus::Pending => {
            let label = match recovered.status {
                OrderStatus::Executed => "EXECUTED (recovered after restart)",
                _ => "CLOSED_EXTERNALLY",
            };
            send_note(ctx, &recovered, label, recovered.executed_price).await;
        }
        Ok(_) => {}
        Err(StoreError::Conflict { .. }) => {} // someone else got there first
        Err(err) => warn!(order_id = order.id, "stale recovery write failed: {err}"),
    }
}

// ─────────────────────────────────────────────────────────
// EXECUTED cross-checks
// ─────────────────────────────────────────────────────────

async fn reconcile_executed(ctx: &EngineCtx, order: Order) {
    let now = ctx.clock.now();
    let held = match ctx
        .repo
        .atomic_transition(
            order.id,
            OrderStatus::Executed,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            now,
        )
        .await
    {
        Ok(order) => order,
        Err(StoreError::Conflict { .. }) => {
            debug!(order_id = order.id, "skipped: engine worker has the order");
            return;
        }
        Err(err) => {
            warn!(order_id = order.id, "reconciliation: could not take critical section: {err}");
            return;
        }
    };

    let adapter = match ctx.registry.adapter_for(&held).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(order_id = held.id, "reconciliation: no adapter: {err}");
            if let Err(err) = restore_status(ctx, &held, OrderStatus::Executed).await {
                warn!(order_id = held.id, "restore failed: {err}");
            }
            return;
        }
    };

    if let Err(err) = check_executed(ctx, adapter.as_ref(), &held).await {
        warn!(order_id = held.id, "reconciliation aborted mid-flight: {err}");
    }
}

async fn check_executed(
    ctx: &EngineCtx,
    adapter: &dyn ExchangeAdapter,
    order: &Order,
) -> Result<(), StoreError> {
    let now = ctx.clock.now();

    let base = match adapter.balance(order.base_asset()).await {
        Ok(balance) => balance,
        Err(err) => {
            debug!(order_id = order.id, "balance unavailable ({err}); deferring");
            return restore_status(ctx, order, OrderStatus::Executed).await;
        }
    };
    let held_amount = base.free + base.locked;
    let expected = order.quantity * (Decimal::ONE - ctx.cfg.dust_buffer);

    // TP fill vs external cancellation: the balance disambiguates.
    if let Some(tp_order_id) = order.tp_order_id.as_deref() {
        let open = match adapter.list_open_orders(&order.symbol).await {
            Ok(open) => open,
            Err(err) => {
                debug!(order_id = order.id, "open orders unavailable ({err}); deferring");
                return restore_status(ctx, order, OrderStatus::Executed).await;
            }
        };
        if !open.iter().any(|o| o.order_id == tp_order_id) {
            if held_amount < expected {
                // Sell went through: the position turned into quote.
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
                info!(order_id = order.id, "🎯 take-profit fill confirmed by balance");
                send_note(ctx, &closed, "CLOSED_TP", order.take_profit).await;
            } else {
                // Balance intact: the user cancelled our TP. Put it back.
                let take_profit = order.take_profit;
                let new_tp = match take_profit {
                    Some(tp) => match filters_for(ctx, adapter, &order.symbol).await {
                        Ok(filters) => {
                            install_tp(ctx, adapter, order, &filters, tp, order.quantity).await
                        }
                        Err(err) => {
                            debug!(order_id = order.id, "filters unavailable ({err}); deferring");
                            None
                        }
                    },
                    None => None,
                };
                let restored = ctx
                    .repo
                    .atomic_transition(
                        order.id,
                        OrderStatus::InExecution,
                        OrderStatus::Executed,
                        TransitionPatch::none().with_tp(new_tp.clone()),
                        now,
                    )
                    .await?;
                if new_tp.is_some() {
                    info!(order_id = order.id, "↩️ externally cancelled TP re-installed");
                    send_note(
                        ctx,
                        &restored,
                        "take-profit order was cancelled on the exchange; re-installed",
                        take_profit,
                    )
                    .await;
                }
            }
            return Ok(());
        }
    }

    // Global external-sell sweep.
    if held_amount < expected {
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
        info!(order_id = order.id, %held_amount, "position sold outside the engine");
        send_note(ctx, &closed, "CLOSED_EXTERNALLY", None).await;
        return Ok(());
    }

    restore_status(ctx, order, OrderStatus::Executed).await
}
