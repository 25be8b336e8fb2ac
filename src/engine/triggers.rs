//! Candle trigger evaluation.
//!
//! Both triggers read the *close* of the last fully closed candle:
//! entries fire when a candle of the plan's size closes at or above the
//! target (and cancel when it closes above the ceiling), stops hit when
//! one closes at or below the stop. Closed candles only — intrabar
//! spikes never whipsaw a plan in or out.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::exchange::{AdapterError, ExchangeAdapter};
use crate::types::{Interval, Order};

/// Outcome of the entry check for a PENDING order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    /// Place the market buy now.
    Fire,
    /// No trigger yet; check again next tick.
    Wait,
    /// The market ran past the ceiling; the plan self-cancels.
    Cancel,
}

/// Outcome of the stop check for an EXECUTED order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Hit,
    Ok,
}

/// Evaluate the entry trigger for a pending order.
pub async fn entry_decision(
    adapter: &dyn ExchangeAdapter,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<EntryDecision, AdapterError> {
    if order.entry_interval == Interval::Market {
        return Ok(EntryDecision::Fire);
    }

    let candle = adapter
        .last_closed_candle(&order.symbol, order.entry_interval)
        .await?;
    // The adapter contract already excludes the in-progress candle;
    // re-check against the engine clock in case an adapter misbehaves.
    if !candle.is_closed(order.entry_interval, now) {
        debug!(order_id = order.id, "adapter returned an open candle; waiting");
        return Ok(EntryDecision::Wait);
    }

    if candle.close > order.max_entry {
        Ok(EntryDecision::Cancel)
    } else if candle.close >= order.entry_price {
        Ok(EntryDecision::Fire)
    } else {
        Ok(EntryDecision::Wait)
    }
}

/// Evaluate the stop-loss trigger for an executed order. Orders without
/// a stop-loss never hit.
pub async fn stop_decision(
    adapter: &dyn ExchangeAdapter,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<StopDecision, AdapterError> {
    let Some(stop_loss) = order.stop_loss else {
        return Ok(StopDecision::Ok);
    };

    let candle = adapter
        .last_closed_candle(&order.symbol, order.stop_interval)
        .await?;
    if !candle.is_closed(order.stop_interval, now) {
        debug!(order_id = order.id, "adapter returned an open candle; skipping stop check");
        return Ok(StopDecision::Ok);
    }

    if candle.close <= stop_loss {
        Ok(StopDecision::Hit)
    } else {
        Ok(StopDecision::Ok)
    }
}
