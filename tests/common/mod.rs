//! Shared test harness: engine over in-memory SQLite, a scriptable mock
//! exchange, a manual clock, and a capturing notification sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::sqlite::SqlitePoolOptions;

use tradeloop::engine::{Engine, ManualClock, NotificationSink};
use tradeloop::exchange::{mock::MockExchange, AdapterRegistry, Candle, FilterCache, SymbolFilters};
use tradeloop::store::{ApiKeyStore, OrderRepository, PlaintextDecryptor};
use tradeloop::types::{Interval, NewOrder};
use tradeloop::EngineConfig;

pub const USER: i64 = 7;

/// Start of test time: two days after the epoch, aligned to every
/// interval the tests use.
pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(2 * Interval::Daily.duration_ms())
        .unwrap()
}

#[derive(Default)]
pub struct CapturingSink {
    pub messages: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl NotificationSink for CapturingSink {
    async fn notify(&self, user_id: i64, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((user_id, message.to_string()));
    }
}

impl CapturingSink {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn containing(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.contains(needle))
            .count()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub adapter: Arc<MockExchange>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<CapturingSink>,
    pub repo: OrderRepository,
    pub filters: Arc<FilterCache>,
    pub api_key_id: i64,
}

pub async fn harness() -> Harness {
    // Single connection so every query sees the same :memory: database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let repo = OrderRepository::new(pool.clone());
    repo.migrate().await.expect("schema");

    let keys = ApiKeyStore::new(pool.clone());
    let api_key_id = keys
        .insert_plaintext(USER, 1, "test-key", "test-secret", true)
        .await
        .expect("api key");

    let filters = Arc::new(FilterCache::new(Duration::from_secs(3600)));
    let registry = Arc::new(AdapterRegistry::new(
        keys,
        Arc::new(PlaintextDecryptor),
        filters.clone(),
        HashMap::from([(1i64, "binance".to_string())]),
        Duration::from_secs(10),
    ));

    let adapter = Arc::new(MockExchange::new());
    registry.insert_adapter(api_key_id, adapter.clone()).await;
    adapter.set_filters(
        "BTCUSDC",
        SymbolFilters {
            lot_step: dec!(0.000001),
            tick_size: dec!(0.01),
            min_notional: dec!(10),
        },
    );

    let clock = Arc::new(ManualClock::new(t0()));
    let sink = Arc::new(CapturingSink::default());
    let engine = Engine::new(
        EngineConfig::default(),
        repo.clone(),
        registry,
        filters.clone(),
        clock.clone(),
        sink.clone(),
    );

    Harness {
        engine,
        adapter,
        clock,
        sink,
        repo,
        filters,
        api_key_id,
    }
}

impl Harness {
    /// The spec's reference plan: BTCUSDC, qty 0.001, entry 91 000,
    /// ceiling 92 000, TP 95 000, SL 90 000, M5 triggers.
    pub fn plan(&self) -> NewOrder {
        NewOrder {
            user_id: USER,
            exchange_id: 1,
            api_key_id: self.api_key_id,
            is_testnet: true,
            symbol: "BTCUSDC".to_string(),
            quantity: dec!(0.001),
            entry_price: dec!(91000),
            max_entry: dec!(92000),
            take_profit: Some(dec!(95000)),
            stop_loss: Some(dec!(90000)),
            entry_interval: Interval::M5,
            stop_interval: Interval::M5,
        }
    }

    /// Script the last closed candle on `interval` so that it closes
    /// exactly at `t0`.
    pub fn close_candle(&self, interval: Interval, close: Decimal) {
        let open_time = t0() - chrono::Duration::milliseconds(interval.duration_ms());
        self.adapter.set_candle(
            "BTCUSDC",
            interval,
            Candle {
                open_time,
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1),
            },
        );
    }

    /// Fund the quote wallet and script a spot price.
    pub fn fund(&self, quote_free: Decimal, spot: Decimal) {
        self.adapter.set_balance("USDC", quote_free);
        self.adapter.set_price("BTCUSDC", spot);
    }
}
