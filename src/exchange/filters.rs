//! Symbol metadata and the rounding rules derived from it.
//!
//! Every quantity handed to a `place_*` call is floored to the symbol's
//! lot step, and every sell price rounded *down* to the tick grid —
//! rounding up could overshoot the wallet balance or the intended
//! ceiling. The process-wide [`FilterCache`] keeps metadata per
//! `(exchange, symbol)` with a TTL, and is evicted whenever a placement
//! bounces with a filter violation so the next attempt refetches.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Filters
// ─────────────────────────────────────────────────────────

/// Per-symbol exchange constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Quantity increment.
    pub lot_step: Decimal,
    /// Price increment.
    pub tick_size: Decimal,
    /// Minimum `qty * price` in quote units.
    pub min_notional: Decimal,
}

impl SymbolFilters {
    pub fn floor_qty(&self, qty: Decimal) -> Decimal {
        floor_to_step(qty, self.lot_step)
    }

    pub fn round_price(&self, price: Decimal) -> Decimal {
        floor_to_step(price, self.tick_size)
    }

    /// `qty * price >= min_notional`; equality passes.
    pub fn meets_min_notional(&self, qty: Decimal, price: Decimal) -> bool {
        qty * price >= self.min_notional
    }
}

/// Largest multiple of `step` not exceeding `value`. A zero or negative
/// step leaves the value untouched (some symbols report no grid).
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

// ─────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    filters: SymbolFilters,
    fetched_at: Instant,
}

/// TTL-bounded metadata cache keyed by `(exchange, symbol)`. Read-mostly;
/// lives for the process lifetime and is shared by adapters and the
/// lifecycle engine.
#[derive(Debug)]
pub struct FilterCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl FilterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached filters if present and fresh.
    pub fn lookup(&self, exchange: &str, symbol: &str) -> Option<SymbolFilters> {
        let entries = self.entries.read().expect("filter cache poisoned");
        let entry = entries.get(&(exchange.to_string(), symbol.to_string()))?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.filters)
    }

    pub fn insert(&self, exchange: &str, symbol: &str, filters: SymbolFilters) {
        let mut entries = self.entries.write().expect("filter cache poisoned");
        entries.insert(
            (exchange.to_string(), symbol.to_string()),
            Entry {
                filters,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop a stale entry (called after a FilterViolation so the next
    /// placement refetches).
    pub fn evict(&self, exchange: &str, symbol: &str) {
        let mut entries = self.entries.write().expect("filter cache poisoned");
        entries.remove(&(exchange.to_string(), symbol.to_string()));
    }
}
