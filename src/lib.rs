//! tradeloop — spot-trading automation engine.
//!
//! Users describe a trade as a declarative plan (entry trigger, entry
//! ceiling, take-profit, stop-loss, candle intervals) and the engine
//! owns the lifecycle: it watches closed candles, places the market
//! buy, installs the resting TP sell, watches the stop, closes the
//! position, reconciles anything done behind its back, and notifies the
//! owner.
//!
//! The crate is a library to the hosting application. Wire it up with a
//! repository ([`store`]), an adapter registry ([`exchange`]), a clock
//! and a notification sink, then drive it through [`Engine`]:
//!
//! ```rust,ignore
//! let engine = Engine::new(cfg, repo, registry, filters, clock, sink);
//! engine.start().await;
//! let id = engine.create_order(plan).await?;
//! ```

pub mod engine;
pub mod error;
pub mod exchange;
pub mod store;
pub mod types;

use std::time::Duration;

use rust_decimal::Decimal;

pub use engine::{Clock, Engine, LogSink, ManualClock, NotificationSink, SystemClock};
pub use error::EngineError;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

/// Engine tuning knobs. Defaults are production values; every field can
/// be overridden from the environment via `from_env`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fast tick driving the lifecycle pass.
    pub engine_tick: Duration,
    /// Slow tick driving reconciliation.
    pub reconcile_tick: Duration,
    /// How long an IN_EXECUTION order may sit untouched before the
    /// stale sweep reclaims it.
    pub stale_after: Duration,
    /// Bounded fan-out per tick.
    pub worker_limit: usize,
    /// Per-request timeout for every adapter call.
    pub call_timeout: Duration,
    /// TTL of cached symbol metadata.
    pub filter_ttl: Duration,
    /// Headroom on the quote-balance check before a buy (fees).
    pub fee_margin: Decimal,
    /// Fraction shaved off sell quantities to absorb fee dust paid in
    /// base asset; also the tolerance for balance comparisons.
    pub dust_buffer: Decimal,
    /// Minimum gap between insufficient-balance notifications per user.
    pub insufficient_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_tick: Duration::from_secs(10),
            reconcile_tick: Duration::from_secs(300),
            stale_after: Duration::from_secs(60),
            worker_limit: 16,
            call_timeout: Duration::from_secs(10),
            filter_ttl: Duration::from_secs(3600),
            fee_margin: Decimal::new(1, 3),
            dust_buffer: Decimal::new(1, 3),
            insufficient_cooldown: Duration::from_secs(24 * 3600),
        }
    }
}

impl EngineConfig {
    /// Load overrides from `TL_*` environment variables (if set).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("TL_ENGINE_TICK_SECS") {
            if let Ok(s) = v.parse() {
                cfg.engine_tick = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TL_RECONCILE_TICK_SECS") {
            if let Ok(s) = v.parse() {
                cfg.reconcile_tick = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TL_STALE_AFTER_SECS") {
            if let Ok(s) = v.parse() {
                cfg.stale_after = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TL_WORKER_LIMIT") {
            if let Ok(n) = v.parse() {
                cfg.worker_limit = n;
            }
        }
        if let Ok(v) = std::env::var("TL_CALL_TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                cfg.call_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TL_FILTER_TTL_SECS") {
            if let Ok(s) = v.parse() {
                cfg.filter_ttl = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TL_FEE_MARGIN") {
            if let Ok(d) = v.parse() {
                cfg.fee_margin = d;
            }
        }
        if let Ok(v) = std::env::var("TL_DUST_BUFFER") {
            if let Ok(d) = v.parse() {
                cfg.dust_buffer = d;
            }
        }
        cfg
    }
}
