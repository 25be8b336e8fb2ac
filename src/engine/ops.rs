//! User-initiated operations: create, edit, cancel, close, split, query.
//!
//! Edits that touch a resting TP go through the same critical section
//! the tick workers use, and validation always precedes cancellation:
//! an edit that would produce an unplaceable TP fails with the old TP
//! still live on the exchange.

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::lifecycle::{
    clear_strikes, close_at_market, filters_for, install_tp, restore_status, send_note,
};
use super::Engine;
use crate::error::EngineError;
use crate::store::{StoreError, TransitionPatch};
use crate::types::{
    validate_plan, validate_stop_interval, NewOrder, Order, OrderFilter, OrderPatch, OrderStatus,
    SplitParams,
};

impl Engine {
    /// Validate and persist a new plan. It is picked up on the next
    /// engine tick; `Market` entries fire there without a candle check.
    pub async fn create_order(&self, plan: NewOrder) -> Result<Order, EngineError> {
        plan.validate().map_err(EngineError::Validation)?;
        let now = self.ctx.clock.now();
        let order = self.ctx.repo.insert(&plan, OrderStatus::Pending, now).await?;
        info!(
            order_id = order.id,
            symbol = %order.symbol,
            entry = %order.entry_price,
            interval = order.entry_interval.as_str(),
            "📋 order created"
        );
        Ok(order)
    }

    pub async fn get_order(&self, id: i64) -> Result<Order, EngineError> {
        self.load(id).await
    }

    pub async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, EngineError> {
        Ok(self.ctx.repo.list_filtered(filter).await?)
    }

    /// Cancel a plan that has not entered yet.
    pub async fn cancel_order(&self, id: i64) -> Result<Order, EngineError> {
        let order = self.load(id).await?;
        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::InExecution => return Err(EngineError::Busy(id)),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    required: "PENDING",
                })
            }
        }
        let now = self.ctx.clock.now();
        let cancelled = match self
            .ctx
            .repo
            .atomic_transition(
                id,
                OrderStatus::Pending,
                OrderStatus::Cancelled,
                TransitionPatch::cancelled(now, "user"),
                now,
            )
            .await
        {
            Ok(order) => order,
            Err(StoreError::Conflict { .. }) => return Err(EngineError::Busy(id)),
            Err(err) => return Err(err.into()),
        };
        clear_strikes(&self.ctx, id).await;
        info!(order_id = id, "order cancelled by user");
        send_note(&self.ctx, &cancelled, "CANCELLED (by user)", None).await;
        Ok(cancelled)
    }

    /// Close an executed position at market: cancel the TP, sell the
    /// wallet balance (floored), finish as CLOSED_MANUAL. On a transient
    /// exchange error the position is restored to EXECUTED and the
    /// returned order reflects that nothing was closed.
    pub async fn close_position(&self, id: i64) -> Result<Order, EngineError> {
        let order = self.load(id).await?;
        match order.status {
            OrderStatus::Executed => {}
            OrderStatus::InExecution => return Err(EngineError::Busy(id)),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    required: "EXECUTED",
                })
            }
        }
        let now = self.ctx.clock.now();
        let held = match self
            .ctx
            .repo
            .atomic_transition(
                id,
                OrderStatus::Executed,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
        {
            Ok(order) => order,
            Err(StoreError::Conflict { .. }) => return Err(EngineError::Busy(id)),
            Err(err) => return Err(err.into()),
        };

        let adapter = match self.ctx.registry.adapter_for(&held).await {
            Ok(adapter) => adapter,
            Err(err) => {
                if let Err(restore_err) =
                    restore_status(&self.ctx, &held, OrderStatus::Executed).await
                {
                    warn!(order_id = id, "restore failed: {restore_err}");
                }
                return Err(err);
            }
        };
        close_at_market(
            &self.ctx,
            adapter.as_ref(),
            &held,
            OrderStatus::ClosedManual,
            "CLOSED_MANUAL",
        )
        .await?;
        self.load(id).await
    }

    /// Edit a non-terminal order. For an executed order with a changed
    /// take-profit, the resting TP is re-pegged: validate the new TP,
    /// cancel the old one, place the new one, commit — in that order.
    pub async fn update_order(&self, id: i64, patch: OrderPatch) -> Result<Order, EngineError> {
        if patch.is_empty() {
            return self.load(id).await;
        }
        let order = self.load(id).await?;
        if order.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id,
                status: order.status,
                required: "non-terminal",
            });
        }
        if order.status == OrderStatus::InExecution {
            return Err(EngineError::Busy(id));
        }

        let candidate = patch.applied_to(&order);
        validate_plan(
            candidate.quantity,
            candidate.entry_price,
            candidate.max_entry,
            candidate.take_profit,
            candidate.stop_loss,
        )
        .map_err(EngineError::Validation)?;
        validate_stop_interval(candidate.stop_loss, candidate.stop_interval)
            .map_err(EngineError::Validation)?;

        let tp_changed = candidate.take_profit != order.take_profit;
        if order.status == OrderStatus::Executed && tp_changed {
            return self.repeg_take_profit(&order, &patch, &candidate).await;
        }

        // No resting order touched: one guarded statement does it.
        let now = self.ctx.clock.now();
        match self.ctx.repo.patch(id, &patch, now).await {
            Ok(updated) => {
                info!(order_id = id, "order updated");
                Ok(updated)
            }
            Err(StoreError::NotEditable {
                status: OrderStatus::InExecution,
                ..
            }) => Err(EngineError::Busy(id)),
            Err(StoreError::NotEditable { status, .. }) => Err(EngineError::InvalidState {
                id,
                status,
                required: "non-terminal",
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn repeg_take_profit(
        &self,
        order: &Order,
        patch: &OrderPatch,
        candidate: &Order,
    ) -> Result<Order, EngineError> {
        let now = self.ctx.clock.now();
        let held = match self
            .ctx
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
            Err(StoreError::Conflict { .. }) => return Err(EngineError::Busy(order.id)),
            Err(err) => return Err(err.into()),
        };

        match self.repeg_held(&held, patch, candidate).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                // Fail with the old TP (and status) intact.
                if let Err(restore_err) =
                    restore_status(&self.ctx, &held, OrderStatus::Executed).await
                {
                    warn!(order_id = held.id, "restore failed: {restore_err}");
                }
                Err(err)
            }
        }
    }

    async fn repeg_held(
        &self,
        held: &Order,
        patch: &OrderPatch,
        candidate: &Order,
    ) -> Result<Order, EngineError> {
        let ctx = &self.ctx;
        let adapter = ctx.registry.adapter_for(held).await?;

        // Validation precedes cancellation.
        let planned = match candidate.take_profit {
            Some(take_profit) => {
                let filters = filters_for(ctx, adapter.as_ref(), &held.symbol)
                    .await
                    .map_err(EngineError::Adapter)?;
                let tp_qty =
                    filters.floor_qty(held.quantity * (Decimal::ONE - ctx.cfg.dust_buffer));
                let tp_price = filters.round_price(take_profit);
                if tp_qty <= Decimal::ZERO || !filters.meets_min_notional(tp_qty, tp_price) {
                    return Err(EngineError::Validation(format!(
                        "take-profit {take_profit} is not placeable on {} (min notional {})",
                        held.symbol, filters.min_notional
                    )));
                }
                Some((tp_qty, tp_price))
            }
            None => None,
        };

        // Only now does the old TP come down.
        if let Some(old_tp) = held.tp_order_id.as_deref() {
            adapter
                .cancel_order(&held.symbol, old_tp)
                .await
                .map_err(EngineError::Adapter)?;
        }

        let new_tp_id = match planned {
            Some((qty, price)) => match adapter.place_limit_sell(&held.symbol, qty, price).await {
                Ok(placed) => Some(placed.order_id),
                Err(err) => {
                    // Old TP is gone already; the executed tick's TP
                    // upkeep re-places one from the committed fields.
                    warn!(order_id = held.id, "new TP placement failed ({err}); deferred");
                    None
                }
            },
            None => None,
        };

        let updated = self
            .ctx
            .repo
            .commit_edit(
                held.id,
                patch,
                Some(new_tp_id.clone()),
                OrderStatus::Executed,
                ctx.clock.now(),
            )
            .await?;
        info!(
            order_id = held.id,
            tp_order_id = new_tp_id.as_deref().unwrap_or("-"),
            "take-profit re-pegged"
        );
        send_note(ctx, &updated, "take-profit updated", candidate.take_profit).await;
        Ok(updated)
    }

    /// Carve an executed position into two orders sharing the original
    /// execution price, each with its own TP/SL. Atomic at the
    /// repository level.
    pub async fn split_order(
        &self,
        id: i64,
        params: SplitParams,
    ) -> Result<(Order, Order), EngineError> {
        let order = self.load(id).await?;
        match order.status {
            OrderStatus::Executed => {}
            OrderStatus::InExecution => return Err(EngineError::Busy(id)),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    required: "EXECUTED",
                })
            }
        }
        if params.split_qty <= Decimal::ZERO || params.split_qty >= order.quantity {
            return Err(EngineError::Validation(format!(
                "split_qty {} must be between 0 and the order quantity {}",
                params.split_qty, order.quantity
            )));
        }
        for (take_profit, stop_loss) in [(params.tp1, params.sl1), (params.tp2, params.sl2)] {
            validate_plan(
                order.quantity,
                order.entry_price,
                order.max_entry,
                take_profit,
                stop_loss,
            )
            .map_err(EngineError::Validation)?;
            validate_stop_interval(stop_loss, order.stop_interval)
                .map_err(EngineError::Validation)?;
        }

        let now = self.ctx.clock.now();
        let held = match self
            .ctx
            .repo
            .atomic_transition(
                id,
                OrderStatus::Executed,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
        {
            Ok(order) => order,
            Err(StoreError::Conflict { .. }) => return Err(EngineError::Busy(id)),
            Err(err) => return Err(err.into()),
        };

        match self.split_held(&held, &params).await {
            Ok(pair) => Ok(pair),
            Err(err) => {
                if let Err(restore_err) =
                    restore_status(&self.ctx, &held, OrderStatus::Executed).await
                {
                    warn!(order_id = id, "restore failed: {restore_err}");
                }
                Err(err)
            }
        }
    }

    async fn split_held(
        &self,
        held: &Order,
        params: &SplitParams,
    ) -> Result<(Order, Order), EngineError> {
        let ctx = &self.ctx;
        let adapter = ctx.registry.adapter_for(held).await?;
        let filters = filters_for(ctx, adapter.as_ref(), &held.symbol)
            .await
            .map_err(EngineError::Adapter)?;

        if let Some(old_tp) = held.tp_order_id.as_deref() {
            adapter
                .cancel_order(&held.symbol, old_tp)
                .await
                .map_err(EngineError::Adapter)?;
        }

        let keep_qty = held.quantity - params.split_qty;
        let tp1_order_id = match params.tp1 {
            Some(tp) => install_tp(ctx, adapter.as_ref(), held, &filters, tp, keep_qty).await,
            None => None,
        };
        let tp2_order_id = match params.tp2 {
            Some(tp) => {
                install_tp(ctx, adapter.as_ref(), held, &filters, tp, params.split_qty).await
            }
            None => None,
        };

        let (kept, carved) = ctx
            .repo
            .split_executed(held, params, tp1_order_id, tp2_order_id, ctx.clock.now())
            .await?;
        info!(
            order_id = kept.id,
            carved_id = carved.id,
            keep_qty = %keep_qty,
            split_qty = %params.split_qty,
            "✂️ position split"
        );
        send_note(
            ctx,
            &kept,
            &format!("split: {} kept, {} carved into order #{}", keep_qty.normalize(), params.split_qty.normalize(), carved.id),
            None,
        )
        .await;
        Ok((kept, carved))
    }

    async fn load(&self, id: i64) -> Result<Order, EngineError> {
        self.ctx.repo.load(id).await.map_err(|err| match err {
            StoreError::NotFound(_) => EngineError::NotFound(id),
            err => err.into(),
        })
    }
}
