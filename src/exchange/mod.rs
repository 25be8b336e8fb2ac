//! Uniform exchange access.
//!
//! [`ExchangeAdapter`] is the single seam between the engine and any
//! exchange: price, balances, candles, order placement and cancellation,
//! open-order listing and symbol metadata. One implementation exists per
//! exchange ([`binance`], [`bybit`]) plus a scriptable [`mock`] for
//! tests. The engine never sees exchange-specific types.
//!
//! Normalization contract shared by every implementation:
//! - sides are upper-case BUY/SELL on the wire,
//! - every value-carrying number is a [`Decimal`], never a float,
//! - candles are returned ascending by open time, and the *last closed*
//!   candle is the newest one whose span has fully elapsed,
//! - a limit order below the symbol's min-notional is rejected locally
//!   with [`AdapterError::FilterViolation`] before any request is sent.

pub mod binance;
pub mod bybit;
pub mod filters;
pub mod mock;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Interval;
pub use filters::{FilterCache, SymbolFilters};
pub use registry::AdapterRegistry;

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

/// Failure taxonomy every adapter maps its wire errors into. The engine
/// keys its retry policy off these variants, so the mapping is part of
/// the adapter contract.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Network unreachable, timeout, or the exchange is down.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    /// 5xx or another retryable wire error.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Request budget exhausted. `retry_after` is surfaced when the
    /// exchange tells us.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected. Not retryable.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Quantity/price off the symbol's grid or below minimums. Not
    /// retryable for this call; the engine may re-plan.
    #[error("filter violation: {0}")]
    FilterViolation(String),

    /// The account cannot fund the order. Not retryable.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Unknown symbol or order id. Treated as success for cancels.
    #[error("not found: {0}")]
    NotFound(String),
}

impl AdapterError {
    /// Whether the engine should silently retry on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Unavailable(_)
                | AdapterError::Transient(_)
                | AdapterError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            AdapterError::Unavailable(err.to_string())
        } else {
            AdapterError::Transient(err.to_string())
        }
    }
}

// ─────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────

/// Free/locked balance of one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// One candlestick. `open_time` marks the start of the span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Whether the candle's span has fully elapsed at `now`.
    pub fn is_closed(&self, interval: Interval, now: DateTime<Utc>) -> bool {
        self.open_time.timestamp_millis() + interval.duration_ms() <= now.timestamp_millis()
    }
}

/// Fill state of a freshly placed order, as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStatus {
    Filled,
    Partial,
    New,
}

/// Result of a `place_*` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub filled_qty: Decimal,
    /// Volume-weighted fill price; absent when nothing filled yet.
    pub avg_fill_price: Option<Decimal>,
    pub status: FillStatus,
}

/// BUY/SELL as normalised across exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// One resting order from the open-orders listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
    /// Exchange order type, upper-cased (LIMIT, MARKET, ...).
    pub kind: String,
}

// ─────────────────────────────────────────────────────────
// The adapter seam
// ─────────────────────────────────────────────────────────

/// Capability set the engine needs from an exchange. Implementations
/// must be cheap to clone behind an `Arc`, thread-safe, and bound every
/// request with a timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable lowercase exchange name (`binance`, `bybit`); used as the
    /// filter-cache key and in logs.
    fn name(&self) -> &str;

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, AdapterError>;

    async fn balance(&self, asset: &str) -> Result<AssetBalance, AdapterError>;

    /// The most recent *fully closed* candle on `interval`. Never the
    /// in-progress one.
    async fn last_closed_candle(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Candle, AdapterError>;

    async fn place_market_buy(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError>;

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError>;

    async fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, AdapterError>;

    /// Cancel by exchange order id. Returns `true` when the order is
    /// gone afterwards, including "was already gone".
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, AdapterError>;

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError>;

    async fn all_assets(&self) -> Result<Vec<AssetBalance>, AdapterError>;
}

/// Pick the last closed candle from an ascending series. Shared by the
/// REST adapters so the exchange's in-progress candle is never handed to
/// a trigger.
pub(crate) fn select_last_closed(
    candles: &[Candle],
    interval: Interval,
    now: DateTime<Utc>,
) -> Option<Candle> {
    candles
        .iter()
        .rev()
        .find(|c| c.is_closed(interval, now))
        .cloned()
}
