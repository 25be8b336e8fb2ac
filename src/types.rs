//! Core domain types: the declarative trade plan, its lifecycle status,
//! and the candle intervals triggers are evaluated on.
//!
//! An [`Order`] is the unit of work. It is created as a plan (entry
//! trigger, ceiling, TP/SL) and accretes execution state as the engine
//! moves it through its lifecycle. Terminal orders are never deleted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Side
// ─────────────────────────────────────────────────────────

/// Direction of the plan. Only long spot plans are supported; the enum
/// exists so storage and API surfaces carry an explicit side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Side::Long),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────

/// Lifecycle status of an order.
///
/// `InExecution` is a transient critical-section marker: exactly one
/// worker may act on an order while it holds this status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    InExecution,
    Executed,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedExternally,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::InExecution => "IN_EXECUTION",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::ClosedTp => "CLOSED_TP",
            OrderStatus::ClosedSl => "CLOSED_SL",
            OrderStatus::ClosedManual => "CLOSED_MANUAL",
            OrderStatus::ClosedExternally => "CLOSED_EXTERNALLY",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "IN_EXECUTION" => Some(OrderStatus::InExecution),
            "EXECUTED" => Some(OrderStatus::Executed),
            "CLOSED_TP" => Some(OrderStatus::ClosedTp),
            "CLOSED_SL" => Some(OrderStatus::ClosedSl),
            "CLOSED_MANUAL" => Some(OrderStatus::ClosedManual),
            "CLOSED_EXTERNALLY" => Some(OrderStatus::ClosedExternally),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are write-once: nothing but `closed_at` may
    /// change after the transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::ClosedTp
                | OrderStatus::ClosedSl
                | OrderStatus::ClosedManual
                | OrderStatus::ClosedExternally
                | OrderStatus::Cancelled
        )
    }
}

// ─────────────────────────────────────────────────────────
// Candle interval
// ─────────────────────────────────────────────────────────

/// Candle interval a trigger is evaluated on. `Market` means "fire on
/// the next tick without any candle check".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interval {
    Market,
    M5,
    M15,
    H1,
    H4,
    Daily,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Market => "MARKET",
            Interval::M5 => "M5",
            Interval::M15 => "M15",
            Interval::H1 => "H1",
            Interval::H4 => "H4",
            Interval::Daily => "DAILY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Interval::Market),
            "M5" => Some(Interval::M5),
            "M15" => Some(Interval::M15),
            "H1" => Some(Interval::H1),
            "H4" => Some(Interval::H4),
            "DAILY" => Some(Interval::Daily),
            _ => None,
        }
    }

    /// Candle span in milliseconds. `Market` has no candle and spans 0.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::Market => 0,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::Daily => 86_400_000,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Order
// ─────────────────────────────────────────────────────────

/// Quote assets recognised when splitting a BASEQUOTE symbol. Longest
/// match wins so e.g. BTCFDUSD resolves before a 4-char fallback.
const QUOTE_ASSETS: &[&str] = &["FDUSD", "USDC", "USDT", "TUSD", "BUSD", "DAI"];

/// A trade plan plus its evolving execution state. Mirrors the `orders`
/// table one-to-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub exchange_id: i64,
    pub api_key_id: i64,
    pub is_testnet: bool,
    /// Trading pair of form BASEQUOTE, e.g. BTCUSDC.
    pub symbol: String,
    pub side: Side,
    /// Base-asset amount the plan wants to buy. Floored to the symbol's
    /// lot step at placement time.
    pub quantity: Decimal,
    pub status: OrderStatus,
    /// Target entry: fire when a candle closes at or above this.
    pub entry_price: Decimal,
    /// Ceiling: a close above this cancels the plan instead of chasing.
    pub max_entry: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub entry_interval: Interval,
    pub stop_interval: Interval,
    pub executed_price: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Why the order was cancelled (`ceiling`, `auth`, `filter`, `user`).
    pub cancel_reason: Option<String>,
    /// Exchange-side id of the resting TP limit sell, when one is live.
    pub tp_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Base asset of the pair (`BTCUSDC` → `BTC`).
    pub fn base_asset(&self) -> &str {
        for quote in QUOTE_ASSETS {
            if let Some(base) = self.symbol.strip_suffix(quote) {
                if !base.is_empty() {
                    return base;
                }
            }
        }
        // Unknown quote: assume a 4-char suffix, else the whole symbol.
        let n = self.symbol.len();
        if n > 4 {
            &self.symbol[..n - 4]
        } else {
            &self.symbol
        }
    }

    /// Quote asset of the pair (`BTCUSDC` → `USDC`).
    pub fn quote_asset(&self) -> &str {
        let base_len = self.base_asset().len();
        &self.symbol[base_len..]
    }
}

// ─────────────────────────────────────────────────────────
// Plans and patches
// ─────────────────────────────────────────────────────────

/// A new plan as submitted by the hosting application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: i64,
    pub exchange_id: i64,
    pub api_key_id: i64,
    pub is_testnet: bool,
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub max_entry: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub entry_interval: Interval,
    pub stop_interval: Interval,
}

impl NewOrder {
    /// Check the plan invariants. Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        validate_plan(
            self.quantity,
            self.entry_price,
            self.max_entry,
            self.take_profit,
            self.stop_loss,
        )?;
        validate_stop_interval(self.stop_loss, self.stop_interval)?;
        if self.symbol.is_empty() || !self.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("invalid symbol {:?}", self.symbol));
        }
        Ok(())
    }
}

/// A stop-loss is evaluated on closed candles, so it needs a real
/// candle interval behind it.
pub fn validate_stop_interval(
    stop_loss: Option<Decimal>,
    stop_interval: Interval,
) -> Result<(), String> {
    if stop_loss.is_some() && stop_interval == Interval::Market {
        return Err("stop_interval must be a candle interval when stop_loss is set".to_string());
    }
    Ok(())
}

/// Shared invariant check for plans and edits:
/// `stop_loss < entry_price < take_profit` and `max_entry >= entry_price`.
pub fn validate_plan(
    quantity: Decimal,
    entry_price: Decimal,
    max_entry: Decimal,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Result<(), String> {
    if quantity <= Decimal::ZERO {
        return Err(format!("quantity must be positive, got {quantity}"));
    }
    if entry_price <= Decimal::ZERO {
        return Err(format!("entry_price must be positive, got {entry_price}"));
    }
    if max_entry < entry_price {
        return Err(format!(
            "max_entry {max_entry} must be >= entry_price {entry_price}"
        ));
    }
    if let Some(tp) = take_profit {
        if tp <= entry_price {
            return Err(format!(
                "take_profit {tp} must be above entry_price {entry_price}"
            ));
        }
    }
    if let Some(sl) = stop_loss {
        if sl >= entry_price {
            return Err(format!(
                "stop_loss {sl} must be below entry_price {entry_price}"
            ));
        }
    }
    Ok(())
}

/// User-driven edit of a non-terminal order. `None` leaves a field
/// untouched; `Some(None)` on TP/SL clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPatch {
    pub entry_price: Option<Decimal>,
    pub max_entry: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Option<Decimal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Option<Decimal>>,
    pub entry_interval: Option<Interval>,
    pub stop_interval: Option<Interval>,
}

impl OrderPatch {
    pub fn is_empty(&self) -> bool {
        self.entry_price.is_none()
            && self.max_entry.is_none()
            && self.take_profit.is_none()
            && self.stop_loss.is_none()
            && self.entry_interval.is_none()
            && self.stop_interval.is_none()
    }

    /// The order as it would look with this patch applied.
    pub fn applied_to(&self, order: &Order) -> Order {
        let mut next = order.clone();
        if let Some(p) = self.entry_price {
            next.entry_price = p;
        }
        if let Some(p) = self.max_entry {
            next.max_entry = p;
        }
        if let Some(tp) = &self.take_profit {
            next.take_profit = *tp;
        }
        if let Some(sl) = &self.stop_loss {
            next.stop_loss = *sl;
        }
        if let Some(i) = self.entry_interval {
            next.entry_interval = i;
        }
        if let Some(i) = self.stop_interval {
            next.stop_interval = i;
        }
        next
    }
}

/// Parameters for carving an executed order into two positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitParams {
    /// Quantity carved out into the second order.
    pub split_qty: Decimal,
    pub tp1: Option<Decimal>,
    pub sl1: Option<Decimal>,
    pub tp2: Option<Decimal>,
    pub sl2: Option<Decimal>,
}

/// Query filter for [`get_orders`](crate::engine::Engine::get_orders).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub exchange_id: Option<i64>,
    pub status: Option<OrderStatus>,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
