//! Binance spot REST adapter (mainnet and testnet).
//!
//! Plain HTTP + serde; no SDK. Signed endpoints use the standard
//! HMAC-SHA256 query signature with the `X-MBX-APIKEY` header. All
//! requests share one `reqwest` client with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use super::{
    select_last_closed, AdapterError, AssetBalance, Candle, ExchangeAdapter, FillStatus,
    FilterCache, OpenOrder, OrderSide, PlacedOrder, SymbolFilters,
};
use crate::store::credentials::ApiCredentials;
use crate::types::Interval;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

// ─────────────────────────────────────────────────────────
// Wire payloads
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(rename = "orderId")]
    order_id: i64,
    status: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: Option<String>,
    #[serde(rename = "cummulativeQuoteQty", default)]
    cummulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOpenOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    side: String,
    price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct BinanceAdapter {
    http: reqwest::Client,
    base_url: String,
    creds: ApiCredentials,
    filters: Arc<FilterCache>,
}

impl BinanceAdapter {
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

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.secret.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_public<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send().await?;
        Self::decode(resp).await
    }

    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let timestamp = Utc::now().timestamp_millis();
        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!("recvWindow={RECV_WINDOW_MS}"));
        query.push(format!("timestamp={timestamp}"));
        let query = query.join("&");
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.creds.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, AdapterError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        let api: ApiErrorBody = serde_json::from_str(&body).unwrap_or(ApiErrorBody {
            code: 0,
            msg: body.clone(),
        });
        Err(map_api_error(status.as_u16(), api.code, &api.msg, retry_after))
    }

    async fn ensure_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError> {
        if let Some(f) = self.filters.lookup(self.name(), symbol) {
            return Ok(f);
        }
        let fetched = self.symbol_filters(symbol).await?;
        self.filters.insert(self.name(), symbol, fetched);
        Ok(fetched)
    }

    fn ack_to_placed(ack: OrderAck) -> Result<PlacedOrder, AdapterError> {
        let filled_qty = ack
            .executed_qty
            .as_deref()
            .map(parse_dec)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let quote_qty = ack
            .cummulative_quote_qty
            .as_deref()
            .map(parse_dec)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let avg_fill_price = if filled_qty > Decimal::ZERO && quote_qty > Decimal::ZERO {
            Some(quote_qty / filled_qty)
        } else {
            None
        };
        Ok(PlacedOrder {
            order_id: ack.order_id.to_string(),
            filled_qty,
            avg_fill_price,
            status: parse_fill_status(&ack.status),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let ticker: TickerPrice = self
            .get_public("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_dec(&ticker.price)
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
        let rows: Vec<Value> = self
            .get_public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", code.to_string()),
                    ("limit", "3".to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&rows)?;
        select_last_closed(&candles, interval, Utc::now()).ok_or_else(|| {
            AdapterError::Unavailable(format!("no closed {code} candle for {symbol}"))
        })
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        debug!(symbol, %qty, "binance market buy");
        let ack: OrderAck = self
            .send_signed(
                reqwest::Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", "BUY".to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", qty.normalize().to_string()),
                    ("newClientOrderId", Uuid::new_v4().simple().to_string()),
                    ("newOrderRespType", "RESULT".to_string()),
                ],
            )
            .await?;
        Self::ack_to_placed(ack)
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        debug!(symbol, %qty, "binance market sell");
        let ack: OrderAck = self
            .send_signed(
                reqwest::Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", "SELL".to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", qty.normalize().to_string()),
                    ("newClientOrderId", Uuid::new_v4().simple().to_string()),
                    ("newOrderRespType", "RESULT".to_string()),
                ],
            )
            .await?;
        Self::ack_to_placed(ack)
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, AdapterError> {
        // Reject sub-notional orders locally instead of burning a request.
        let filters = self.ensure_filters(symbol).await?;
        if !filters.meets_min_notional(qty, price) {
            return Err(AdapterError::FilterViolation(format!(
                "{symbol}: {qty} x {price} below min notional {}",
                filters.min_notional
            )));
        }
        debug!(symbol, %qty, %price, "binance limit sell");
        let ack: OrderAck = self
            .send_signed(
                reqwest::Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", "SELL".to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("quantity", qty.normalize().to_string()),
                    ("price", price.normalize().to_string()),
                    ("newClientOrderId", Uuid::new_v4().simple().to_string()),
                ],
            )
            .await?;
        Self::ack_to_placed(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, AdapterError> {
        let result: Result<OrderAck, AdapterError> = self
            .send_signed(
                reqwest::Method::DELETE,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            // Already gone counts as cancelled.
            Err(AdapterError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError> {
        let raw: Vec<RawOpenOrder> = self
            .send_signed(
                reqwest::Method::GET,
                "/api/v3/openOrders",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        raw.into_iter()
            .map(|o| {
                Ok(OpenOrder {
                    order_id: o.order_id.to_string(),
                    side: if o.side == "SELL" {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    price: parse_dec(&o.price)?,
                    qty: parse_dec(&o.orig_qty)?,
                    kind: o.kind,
                })
            })
            .collect()
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, AdapterError> {
        let info: Value = self
            .get_public("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        let symbol_info = info
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|s| s.first())
            .ok_or_else(|| AdapterError::NotFound(format!("symbol {symbol}")))?;
        parse_symbol_filters(symbol_info)
    }

    async fn all_assets(&self) -> Result<Vec<AssetBalance>, AdapterError> {
        let account: AccountInfo = self
            .send_signed(reqwest::Method::GET, "/api/v3/account", &[])
            .await?;
        account
            .balances
            .into_iter()
            .map(|b| {
                Ok(AssetBalance {
                    asset: b.asset,
                    free: parse_dec(&b.free)?,
                    locked: parse_dec(&b.locked)?,
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
        Interval::M5 => Ok("5m"),
        Interval::M15 => Ok("15m"),
        Interval::H1 => Ok("1h"),
        Interval::H4 => Ok("4h"),
        Interval::Daily => Ok("1d"),
    }
}

fn parse_dec(s: &str) -> Result<Decimal, AdapterError> {
    s.parse::<Decimal>()
        .map_err(|e| AdapterError::Transient(format!("bad decimal {s:?}: {e}")))
}

fn parse_fill_status(s: &str) -> FillStatus {
    match s {
        "FILLED" => FillStatus::Filled,
        "PARTIALLY_FILLED" => FillStatus::Partial,
        _ => FillStatus::New,
    }
}

/// Klines come as arrays: `[open_time, open, high, low, close, volume, ...]`,
/// ascending by open time.
fn parse_klines(rows: &[Value]) -> Result<Vec<Candle>, AdapterError> {
    rows.iter()
        .map(|row| {
            let arr = row
                .as_array()
                .filter(|a| a.len() >= 6)
                .ok_or_else(|| AdapterError::Transient("malformed kline row".to_string()))?;
            let open_ms = arr[0]
                .as_i64()
                .ok_or_else(|| AdapterError::Transient("kline open time".to_string()))?;
            let field = |i: usize| -> Result<Decimal, AdapterError> {
                let s = arr[i]
                    .as_str()
                    .ok_or_else(|| AdapterError::Transient("kline field".to_string()))?;
                parse_dec(s)
            };
            Ok(Candle {
                open_time: Utc
                    .timestamp_millis_opt(open_ms)
                    .single()
                    .ok_or_else(|| AdapterError::Transient("kline open time".to_string()))?,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            })
        })
        .collect()
}

fn parse_symbol_filters(symbol_info: &Value) -> Result<SymbolFilters, AdapterError> {
    let filters = symbol_info
        .get("filters")
        .and_then(|f| f.as_array())
        .ok_or_else(|| AdapterError::Transient("exchangeInfo without filters".to_string()))?;

    let field = |filter_type: &str, key: &str| -> Option<Decimal> {
        filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
            .and_then(|f| f.get(key))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    };

    Ok(SymbolFilters {
        lot_step: field("LOT_SIZE", "stepSize").unwrap_or(Decimal::ZERO),
        tick_size: field("PRICE_FILTER", "tickSize").unwrap_or(Decimal::ZERO),
        // Spot uses NOTIONAL nowadays; older payloads say MIN_NOTIONAL.
        min_notional: field("NOTIONAL", "minNotional")
            .or_else(|| field("MIN_NOTIONAL", "minNotional"))
            .unwrap_or(Decimal::ZERO),
    })
}

fn map_api_error(
    http_status: u16,
    code: i64,
    msg: &str,
    retry_after: Option<Duration>,
) -> AdapterError {
    match (http_status, code) {
        (429, _) | (418, _) | (_, -1003) => AdapterError::RateLimited { retry_after },
        (401, _) | (403, _) | (_, -2014) | (_, -2015) => AdapterError::Auth(msg.to_string()),
        (_, -2010) if msg.to_ascii_lowercase().contains("insufficient") => {
            AdapterError::InsufficientBalance(msg.to_string())
        }
        (_, -1013) | (_, -1111) | (_, -2010) => AdapterError::FilterViolation(msg.to_string()),
        (_, -2011) | (_, -1121) => AdapterError::NotFound(msg.to_string()),
        (s, _) if s >= 500 => AdapterError::Transient(format!("HTTP {s}: {msg}")),
        (s, c) => AdapterError::Transient(format!("HTTP {s} code {c}: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_interval_codes() {
        assert_eq!(interval_code(Interval::M5).unwrap(), "5m");
        assert_eq!(interval_code(Interval::H4).unwrap(), "4h");
        assert_eq!(interval_code(Interval::Daily).unwrap(), "1d");
        assert!(interval_code(Interval::Market).is_err());
    }

    #[test]
    fn test_parse_klines() {
        let rows = vec![
            json!([0i64, "100.0", "101.0", "99.0", "100.5", "12.3", 299999i64]),
            json!([300000i64, "100.5", "102.0", "100.1", "101.7", "9.9", 599999i64]),
        ];
        let candles = parse_klines(&rows).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(101.7));
        assert_eq!(candles[0].open_time.timestamp_millis(), 0);
    }

    #[test]
    fn test_parse_symbol_filters() {
        let info = json!({
            "symbol": "BTCUSDC",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                {"filterType": "LOT_SIZE", "stepSize": "0.00001"},
                {"filterType": "NOTIONAL", "minNotional": "5.0"}
            ]
        });
        let f = parse_symbol_filters(&info).unwrap();
        assert_eq!(f.tick_size, dec!(0.01));
        assert_eq!(f.lot_step, dec!(0.00001));
        assert_eq!(f.min_notional, dec!(5.0));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_api_error(429, 0, "", None),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            map_api_error(400, -2010, "Account has insufficient balance", None),
            AdapterError::InsufficientBalance(_)
        ));
        assert!(matches!(
            map_api_error(400, -2010, "Stop price would trigger immediately", None),
            AdapterError::FilterViolation(_)
        ));
        assert!(matches!(
            map_api_error(400, -1013, "Filter failure: LOT_SIZE", None),
            AdapterError::FilterViolation(_)
        ));
        assert!(matches!(
            map_api_error(400, -2011, "Unknown order sent", None),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            map_api_error(401, -2014, "API-key format invalid", None),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            map_api_error(502, 0, "", None),
            AdapterError::Transient(_)
        ));
    }

    #[test]
    fn test_fill_status() {
        assert_eq!(parse_fill_status("FILLED"), FillStatus::Filled);
        assert_eq!(parse_fill_status("PARTIALLY_FILLED"), FillStatus::Partial);
        assert_eq!(parse_fill_status("NEW"), FillStatus::New);
    }
}
