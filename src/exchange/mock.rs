//! Scriptable in-memory exchange for tests.
//!
//! Keeps a tiny book of balances and open orders, fills market orders
//! instantly at the scripted spot price, and lets a test arm one-shot
//! errors per operation to exercise the engine's failure policies.
//! External interference (manual sells, cancelled TPs) is simulated by
//! mutating [`MockExchange::state`] directly.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{
    AdapterError, AssetBalance, Candle, ExchangeAdapter, FillStatus, OpenOrder, OrderSide,
    PlacedOrder, SymbolFilters,
};
use crate::types::Interval;

#[derive(Debug, Default)]
pub struct MockState {
    pub prices: HashMap<String, Decimal>,
    pub candles: HashMap<(String, Interval), Candle>,
    pub balances: HashMap<String, AssetBalance>,
    pub open_orders: HashMap<String, Vec<OpenOrder>>,
    pub filters: HashMap<String, SymbolFilters>,
    /// One-shot failures keyed by operation name.
    pub fail_next: HashMap<&'static str, AdapterError>,
    pub market_buys: Vec<(String, Decimal)>,
    pub market_sells: Vec<(String, Decimal)>,
    pub limit_sells: Vec<(String, Decimal, Decimal)>,
    pub cancels: Vec<(String, String)>,
    next_order_id: u64,
}

impl MockState {
    fn take_failure(&mut self, op: &'static str) -> Result<(), AdapterError> {
        match self.fail_next.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("M{}", self.next_order_id)
    }

    fn price_of(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| AdapterError::Unavailable(format!("no price for {symbol}")))
    }

    fn credit(&mut self, asset: &str, amount: Decimal) {
        let entry = self
            .balances
            .entry(asset.to_string())
            .or_insert(AssetBalance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            });
        entry.free += amount;
    }
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Direct access for scripting and assertions.
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_candle(&self, symbol: &str, interval: Interval, candle: Candle) {
        self.state()
            .candles
            .insert((symbol.to_string(), interval), candle);
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        self.state().balances.insert(
            asset.to_string(),
            AssetBalance {
                asset: asset.to_string(),
                free,
                locked: Decimal::ZERO,
            },
        );
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.state().filters.insert(symbol.to_string(), filters);
    }

    pub fn fail_next(&self, op: &'static str, err: AdapterError) {
        self.state().fail_next.insert(op, err);
    }

    /// Simulate an external actor removing a resting order.
    pub fn drop_open_order(&self, symbol: &str, order_id: &str) {
        if let Some(orders) = self.state().open_orders.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
    }

    fn split_symbol(symbol: &str) -> (String, String) {
        // Mirrors Order::base_asset; the mock only needs common quotes.
        for quote in ["FDUSD", "USDC", "USDT", "BUSD", "DAI"] {
            if let Some(base) = symbol.strip_suffix(quote) {
                if !base.is_empty() {
                    return (base.to_string(), quote.to_string());
                }
            }
        }
        let n = symbol.len();
        if n > 4 {
            (symbol[..n - 4].to_string(), symbol[n - 4..].to_string())
        } else {
            (symbol.to_string(), String::new())
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let mut state = self.state();
        state.take_failure("spot_price")?;
        state.price_of(symbol)
    }

    async fn balance(&self, asset: &str) -> Result<AssetBalance, AdapterError> {
        let mut state = self.state();
        state.take_failure("balance")?;
        Ok(state.balances.get(asset).cloned().unwrap_or(AssetBalance {
            asset: asset.to_string(),
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        }))
    }

    async fn last_closed_candle(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Candle, AdapterError> {
        let mut state = self.state();
        state.take_failure("last_closed_candle")?;
        state
            .candles
            .get(&(symbol.to_string(), interval))
            .cloned()
            .ok_or_else(|| AdapterError::Unavailable(format!("no candle for {symbol}")))
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        let mut state = self.state();
        state.take_failure("place_market_buy")?;
        let price = state.price_of(symbol)?;
        state.market_buys.push((symbol.to_string(), qty));

        let (base, quote) = Self::split_symbol(symbol);
        state.credit(&base, qty);
        state.credit(&quote, -(qty * price));

        let order_id = state.next_id();
        Ok(PlacedOrder {
            order_id,
            filled_qty: qty,
            avg_fill_price: Some(price),
            status: FillStatus::Filled,
        })
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        let mut state = self.state();
        state.take_failure("place_market_sell")?;
        let price = state.price_of(symbol)?;
        state.market_sells.push((symbol.to_string(), qty));

        let (base, quote) = Self::split_symbol(symbol);
        state.credit(&base, -qty);
        state.credit(&quote, qty * price);

        let order_id = state.next_id();
        Ok(PlacedOrder {
            order_id,
            filled_qty: qty,
            avg_fill_price: Some(price),
            status: FillStatus::Filled,
        })
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        let mut state = self.state();
        state.take_failure("place_limit_sell")?;
        if let Some(filters) = state.filters.get(symbol) {
            if !filters.meets_min_notional(qty, price) {
                return Err(AdapterError::FilterViolation(format!(
                    "{symbol}: {qty} x {price} below min notional {}",
                    filters.min_notional
                )));
            }
        }
        state.limit_sells.push((symbol.to_string(), qty, price));

        let order_id = state.next_id();
        state
            .open_orders
            .entry(symbol.to_string())
            .or_default()
            .push(OpenOrder {
                order_id: order_id.clone(),
                side: OrderSide::Sell,
                price,
                qty,
                kind: "LIMIT".to_string(),
            });
        Ok(PlacedOrder {
            order_id,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            status: FillStatus::New,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, AdapterError> {
        let mut state = self.state();
        state.take_failure("cancel_order")?;
        state
            .cancels
            .push((symbol.to_string(), order_id.to_string()));
        if let Some(orders) = state.open_orders.get_mut(symbol) {
            let before = orders.len();
            orders.retain(|o| o.order_id != order_id);
            if orders.len() < before {
                return Ok(true);
            }
        }
        // Already gone; cancels report success anyway.
        Ok(true)
    }

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError> {
        let mut state = self.state();
        state.take_failure("list_open_orders")?;
        Ok(state.open_orders.get(symbol).cloned().unwrap_or_default())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError> {
        let mut state = self.state();
        state.take_failure("symbol_filters")?;
        state
            .filters
            .get(symbol)
            .copied()
            .ok_or_else(|| AdapterError::NotFound(format!("symbol {symbol}")))
    }

    async fn all_assets(&self) -> Result<Vec<AssetBalance>, AdapterError> {
        let mut state = self.state();
        state.take_failure("all_assets")?;
        Ok(state.balances.values().cloned().collect())
    }
}
