//! Per-credential adapter registry.
//!
//! Adapter clients are built lazily from decrypted credentials, cached
//! for the process lifetime keyed by `api_key_id`, and shared behind
//! `Arc`. The registry also tracks credentials paused after an auth
//! rejection: every order routed through paused credentials is skipped
//! until the hosting application calls [`AdapterRegistry::invalidate`]
//! (which it does when the user updates their keys).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use super::binance::BinanceAdapter;
use super::bybit::BybitAdapter;
use super::{ExchangeAdapter, FilterCache};
use crate::error::EngineError;
use crate::store::{ApiKeyStore, CredentialDecryptor};
use crate::types::Order;

pub struct AdapterRegistry {
    key_store: ApiKeyStore,
    decryptor: Arc<dyn CredentialDecryptor>,
    filters: Arc<FilterCache>,
    /// exchange_id -> lowercase exchange name, from the `exchanges` table.
    exchanges: HashMap<i64, String>,
    call_timeout: Duration,
    clients: RwLock<HashMap<i64, Arc<dyn ExchangeAdapter>>>,
    paused: RwLock<HashSet<i64>>,
}

impl AdapterRegistry {
    pub fn new(
        key_store: ApiKeyStore,
        decryptor: Arc<dyn CredentialDecryptor>,
        filters: Arc<FilterCache>,
        exchanges: HashMap<i64, String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            key_store,
            decryptor,
            filters,
            exchanges,
            call_timeout,
            clients: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
        }
    }

    /// The adapter for an order's credentials, building and caching it
    /// on first use.
    pub async fn adapter_for(&self, order: &Order) -> Result<Arc<dyn ExchangeAdapter>, EngineError> {
        if self.is_paused(order.api_key_id).await {
            return Err(EngineError::Credentials(format!(
                "api key {} is paused after an auth rejection",
                order.api_key_id
            )));
        }
        if let Some(adapter) = self.clients.read().await.get(&order.api_key_id) {
            return Ok(adapter.clone());
        }

        let record = self
            .key_store
            .load(order.api_key_id)
            .await
            .map_err(|e| EngineError::Credentials(format!("api key {}: {e}", order.api_key_id)))?;
        let creds = self
            .decryptor
            .decrypt(&record)
            .await
            .map_err(EngineError::Credentials)?;
        let name = self
            .exchanges
            .get(&order.exchange_id)
            .map(String::as_str)
            .ok_or_else(|| {
                EngineError::Credentials(format!("unknown exchange id {}", order.exchange_id))
            })?;

        let adapter: Arc<dyn ExchangeAdapter> = match name {
            "binance" => Arc::new(BinanceAdapter::new(
                creds,
                record.is_testnet,
                self.filters.clone(),
                self.call_timeout,
            )?),
            "bybit" => Arc::new(BybitAdapter::new(
                creds,
                record.is_testnet,
                self.filters.clone(),
                self.call_timeout,
            )?),
            other => {
                return Err(EngineError::Credentials(format!(
                    "no adapter for exchange {other:?}"
                )))
            }
        };

        let mut clients = self.clients.write().await;
        // A concurrent builder may have won; keep the first one.
        let adapter = clients
            .entry(order.api_key_id)
            .or_insert(adapter)
            .clone();
        info!(api_key_id = order.api_key_id, exchange = name, "adapter client ready");
        Ok(adapter)
    }

    /// Register a prebuilt adapter for these credentials (tests, paper
    /// trading).
    pub async fn insert_adapter(&self, api_key_id: i64, adapter: Arc<dyn ExchangeAdapter>) {
        self.clients.write().await.insert(api_key_id, adapter);
    }

    /// Stop routing orders through these credentials until they are
    /// invalidated (auth rejection observed).
    pub async fn pause(&self, api_key_id: i64) {
        self.paused.write().await.insert(api_key_id);
    }

    pub async fn is_paused(&self, api_key_id: i64) -> bool {
        self.paused.read().await.contains(&api_key_id)
    }

    /// Drop the cached client and lift the pause — called when the user
    /// replaces their keys.
    pub async fn invalidate(&self, api_key_id: i64) {
        self.clients.write().await.remove(&api_key_id);
        self.paused.write().await.remove(&api_key_id);
    }
}
