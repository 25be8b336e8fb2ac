//! Bybit v5 spot REST adapter (mainnet and testnet).
//!
//! v5 wraps every payload in `{retCode, retMsg, result}`; a 200 with a
//! non-zero retCode is still an error. Signed requests carry the
//! `X-BAPI-*` headers with
//! `HMAC-SHA256(timestamp + api_key + recv_window + payload)`.
//! Bybit returns klines newest-first; they are reversed here so callers
//! always see ascending open times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use super::{
    select_last_closed, AdapterError, AssetBalance, Candle, ExchangeAdapter, FillStatus,
    FilterCache, OpenOrder, OrderSide, PlacedOrder, SymbolFilters,
};
use crate::store::credentials::ApiCredentials;
use crate::types::Interval;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

pub struct BybitAdapter {
    http: reqwest::Client,
    base_url: String,
    creds: ApiCredentials,
    filters: Arc<FilterCache>,
}

impl BybitAdapter {
    pub fn new(
        creds: ApiCredentials,
        is_testnet: bool,
        filters: Arc<FilterCache>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: if is_testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            creds,
            filters,
        })
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let prehash = format!(
            "{timestamp}{}{RECV_WINDOW_MS}{payload}",
            self.creds.api_key
        );
        let mut mac = HmacSha256::new_from_slice(self.creds.secret.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_public(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send().await?;
        Self::unwrap_envelope(resp).await
    }

    async fn get_signed(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &query_string);
        let url = format!("{}{}?{}", self.base_url, path, query_string);
        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    async fn post_signed(&self, path: &str, body: &Value) -> Result<Value, AdapterError> {
        let payload = body.to_string();
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &payload);
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    async fn unwrap_envelope(resp: reqwest::Response) -> Result<Value, AdapterError> {
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        if status.as_u16() == 429 {
            return Err(AdapterError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!("HTTP {status}")));
        }
        let envelope: Envelope = resp.json().await?;
        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, &envelope.ret_msg, retry_after));
        }
        Ok(envelope.result)
    }

    async fn ensure_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError> {
        if let Some(f) = self.filters.lookup(self.name(), symbol) {
            return Ok(f);
        }
        let fetched = self.symbol_filters(symbol).await?;
        self.filters.insert(self.name(), symbol, fetched);
        Ok(fetched)
    }

    async fn create_order(&self, body: Value) -> Result<PlacedOrder, AdapterError> {
        let result = self.post_signed("/v5/order/create", &body).await?;
        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Transient("order response without orderId".to_string()))?
            .to_string();
        // v5 acks carry no fill info; reconciliation reads balances instead.
        Ok(PlacedOrder {
            order_id,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            status: FillStatus::New,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let result = self
            .get_public(
                "/v5/market/tickers",
                &[
                    ("category", "spot".to_string()),
                    ("symbol", symbol.to_string()),
                ],
            )
            .await?;
        let price = result
            .pointer("/list/0/lastPrice")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::NotFound(format!("ticker for {symbol}")))?;
        parse_dec(price)
    }

    async fn balance(&self, asset: &str) -> Result<AssetBalance, AdapterError> {
        let all = self.all_assets().await?;
        Ok(all
            .into_iter()
            .find(|b| b.asset == asset)
            .unwrap_or(AssetBalance {
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
        let code = interval_code(interval)?;
        let result = self
            .get_public(
                "/v5/market/kline",
                &[
                    ("category", "spot".to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", code.to_string()),
                    ("limit", "3".to_string()),
                ],
            )
            .await?;
        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::Transient("kline response without list".to_string()))?;
        let candles = parse_klines(rows)?;
        select_last_closed(&candles, interval, Utc::now()).ok_or_else(|| {
            AdapterError::Unavailable(format!("no closed {code} candle for {symbol}"))
        })
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        debug!(symbol, %qty, "bybit market buy");
        // marketUnit=baseCoin keeps the qty in base units; spot market
        // buys default to quote units otherwise.
        self.create_order(json!({
            "category": "spot",
            "symbol": symbol,
            "side": "Buy",
            "orderType": "Market",
            "qty": qty.normalize().to_string(),
            "marketUnit": "baseCoin",
            "orderLinkId": Uuid::new_v4().simple().to_string(),
        }))
        .await
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        debug!(symbol, %qty, "bybit market sell");
        self.create_order(json!({
            "category": "spot",
            "symbol": symbol,
            "side": "Sell",
            "orderType": "Market",
            "qty": qty.normalize().to_string(),
            "marketUnit": "baseCoin",
            "orderLinkId": Uuid::new_v4().simple().to_string(),
        }))
        .await
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        let filters = self.ensure_filters(symbol).await?;
        if !filters.meets_min_notional(qty, price) {
            return Err(AdapterError::FilterViolation(format!(
                "{symbol}: {qty} x {price} below min notional {}",
                filters.min_notional
            )));
        }
        debug!(symbol, %qty, %price, "bybit limit sell");
        self.create_order(json!({
            "category": "spot",
            "symbol": symbol,
            "side": "Sell",
            "orderType": "Limit",
            "timeInForce": "GTC",
            "qty": qty.normalize().to_string(),
            "price": price.normalize().to_string(),
            "orderLinkId": Uuid::new_v4().simple().to_string(),
        }))
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, AdapterError> {
        let result = self
            .post_signed(
                "/v5/order/cancel",
                &json!({
                    "category": "spot",
                    "symbol": symbol,
                    "orderId": order_id,
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(AdapterError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError> {
        let result = self
            .get_signed(
                "/v5/order/realtime",
                &[
                    ("category", "spot".to_string()),
                    ("symbol", symbol.to_string()),
                ],
            )
            .await?;
        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        rows.iter()
            .map(|o| {
                let str_field = |key: &str| -> Result<&str, AdapterError> {
                    o.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
                        AdapterError::Transient(format!("open order without {key}"))
                    })
                };
                Ok(OpenOrder {
                    order_id: str_field("orderId")?.to_string(),
                    side: if str_field("side")?.eq_ignore_ascii_case("sell") {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    price: parse_dec(str_field("price")?)?,
                    qty: parse_dec(str_field("qty")?)?,
                    kind: str_field("orderType")?.to_ascii_uppercase(),
                })
            })
            .collect()
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError> {
        let result = self
            .get_public(
                "/v5/market/instruments-info",
                &[
                    ("category", "spot".to_string()),
                    ("symbol", symbol.to_string()),
                ],
            )
            .await?;
        let info = result
            .pointer("/list/0")
            .ok_or_else(|| AdapterError::NotFound(format!("symbol {symbol}")))?;
        parse_instrument_filters(info)
    }

    async fn all_assets(&self) -> Result<Vec<AssetBalance>, AdapterError> {
        let result = self
            .get_signed(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
            )
            .await?;
        let coins = result
            .pointer("/list/0/coin")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        coins
            .iter()
            .map(|c| {
                let asset = c
                    .get("coin")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let total = c
                    .get("walletBalance")
                    .and_then(|v| v.as_str())
                    .map(parse_dec)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO);
                let locked = c
                    .get("locked")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(parse_dec)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO);
                Ok(AssetBalance {
                    asset,
                    free: total - locked,
                    locked,
                })
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────────────────

fn interval_code(interval: Interval) -> Result<&'static str, AdapterError> {
    match interval {
        Interval::Market => Err(AdapterError::Unavailable(
            "MARKET entries have no candle series".to_string(),
        )),
        Interval::M5 => Ok("5"),
        Interval::M15 => Ok("15"),
        Interval::H1 => Ok("60"),
        Interval::H4 => Ok("240"),
        Interval::Daily => Ok("D"),
    }
}

fn parse_dec(s: &str) -> Result<Decimal, AdapterError> {
    s.parse::<Decimal>()
        .map_err(|e| AdapterError::Transient(format!("bad decimal {s:?}: {e}")))
}

/// Rows are `["startTime","open","high","low","close","volume","turnover"]`
/// newest-first; reversed to ascending before selection.
fn parse_klines(rows: &[Value]) -> Result<Vec<Candle>, AdapterError> {
    let mut candles: Vec<Candle> = rows
        .iter()
        .map(|row| -> Result<Candle, AdapterError> {
            let arr = row
                .as_array()
                .filter(|a| a.len() >= 6)
                .ok_or_else(|| AdapterError::Transient("malformed kline row".to_string()))?;
            let field = |i: usize| -> Result<&str, AdapterError> {
                arr[i]
                    .as_str()
                    .ok_or_else(|| AdapterError::Transient("kline field".to_string()))
            };
            let open_ms = field(0)?
                .parse::<i64>()
                .map_err(|e| AdapterError::Transient(format!("kline open time: {e}")))?;
            Ok(Candle {
                open_time: Utc
                    .timestamp_millis_opt(open_ms)
                    .single()
                    .ok_or_else(|| AdapterError::Transient("kline open time".to_string()))?,
                open: parse_dec(field(1)?)?,
                high: parse_dec(field(2)?)?,
                low: parse_dec(field(3)?)?,
                close: parse_dec(field(4)?)?,
                volume: parse_dec(field(5)?)?,
            })
        })
        .collect::<Result<_, _>>()?;
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

fn parse_instrument_filters(info: &Value) -> Result<SymbolFilters, AdapterError> {
    let dec_at = |pointer: &str| -> Option<Decimal> {
        info.pointer(pointer)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    };
    Ok(SymbolFilters {
        lot_step: dec_at("/lotSizeFilter/basePrecision").unwrap_or(Decimal::ZERO),
        tick_size: dec_at("/priceFilter/tickSize").unwrap_or(Decimal::ZERO),
        min_notional: dec_at("/lotSizeFilter/minOrderAmt").unwrap_or(Decimal::ZERO),
    })
}

fn map_ret_code(code: i64, msg: &str, retry_after: Option<Duration>) -> AdapterError {
    match code {
        10006 | 10018 => AdapterError::RateLimited { retry_after },
        10003 | 10004 | 10005 | 33004 => AdapterError::Auth(format!("retCode {code}: {msg}")),
        110007 | 170131 => AdapterError::InsufficientBalance(format!("retCode {code}: {msg}")),
        170136 | 170137 | 170140 | 170124 => {
            AdapterError::FilterViolation(format!("retCode {code}: {msg}"))
        }
        110001 | 170213 => AdapterError::NotFound(format!("retCode {code}: {msg}")),
        10016 => AdapterError::Transient(format!("retCode {code}: {msg}")),
        _ => AdapterError::Transient(format!("retCode {code}: {msg}")),
    }
}
