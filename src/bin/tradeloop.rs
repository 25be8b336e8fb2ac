//! tradeloop service binary: SQLite-backed engine with log notifications.
//!
//! Configuration comes from the environment (`.env` is honored):
//! `DATABASE_URL` plus the `TL_*` engine knobs. Logs go to stdout and a
//! daily-rolled file under `logs/`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::Row;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tradeloop::engine::{Engine, LogSink, SystemClock};
use tradeloop::exchange::{AdapterRegistry, FilterCache};
use tradeloop::store::{self, ApiKeyStore, OrderRepository, PlaintextDecryptor};
use tradeloop::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "tradeloop.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  tradeloop — spot trading automation service");
    info!("═══════════════════════════════════════════════════");

    let cfg = EngineConfig::from_env();
    let db_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://tradeloop.db".to_string());
    info!(%db_url, "opening database");
    let pool = store::connect(&db_url).await.context("open database")?;
    let repo = OrderRepository::new(pool.clone());
    repo.migrate().await.context("apply schema")?;

    let exchanges = load_exchanges(&pool).await.context("load exchanges")?;
    info!(count = exchanges.len(), "exchanges registered");

    let filters = Arc::new(FilterCache::new(cfg.filter_ttl));
    // Standalone runs keep API keys in the clear; a hosting application
    // plugs its own decryptor in here.
    let registry = Arc::new(AdapterRegistry::new(
        ApiKeyStore::new(pool.clone()),
        Arc::new(PlaintextDecryptor),
        filters.clone(),
        exchanges,
        cfg.call_timeout,
    ));

    let engine = Engine::new(
        cfg,
        repo,
        registry,
        filters,
        Arc::new(SystemClock),
        Arc::new(LogSink),
    );
    engine.start().await;

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown signal received");
    engine.stop().await;
    Ok(())
}

/// Exchange id → name routing table, seeded with the built-in adapters
/// on first run.
async fn load_exchanges(pool: &sqlx::SqlitePool) -> anyhow::Result<HashMap<i64, String>> {
    let rows = sqlx::query("SELECT id, name FROM exchanges")
        .fetch_all(pool)
        .await?;
    let mut exchanges: HashMap<i64, String> = rows
        .iter()
        .map(|row| (row.get::<i64, _>("id"), row.get::<String, _>("name")))
        .collect();
    if exchanges.is_empty() {
        for (id, name) in [(1i64, "binance"), (2, "bybit")] {
            sqlx::query("INSERT OR IGNORE INTO exchanges (id, name) VALUES (?, ?)")
                .bind(id)
                .bind(name)
                .execute(pool)
                .await?;
            exchanges.insert(id, name.to_string());
        }
    }
    Ok(exchanges)
}
