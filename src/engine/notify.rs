//! Owner notifications.
//!
//! The engine emits one plain-text event per state transition through
//! [`NotificationSink`]; delivery (Telegram, mail, ...) is the hosting
//! application's concern. The default [`LogSink`] writes events to the
//! log so the engine is observable without any transport wired up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::types::Order;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: i64, message: &str);
}

/// Tracing-backed default sink.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, user_id: i64, message: &str) {
        info!(user_id, "📣 {message}");
    }
}

/// One event line: order id, symbol, transition, qty, price, timestamp.
pub fn transition_message(
    order: &Order,
    transition: &str,
    price: Option<Decimal>,
    at: DateTime<Utc>,
) -> String {
    let mut msg = format!(
        "order #{} {} {} qty={}",
        order.id,
        order.symbol,
        transition,
        order.quantity.normalize(),
    );
    if let Some(price) = price {
        msg.push_str(&format!(" price={}", price.normalize()));
    }
    msg.push_str(&format!(" at {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Interval, OrderStatus, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn test_transition_message_format() {
        let order = Order {
            id: 42,
            user_id: 7,
            exchange_id: 1,
            api_key_id: 1,
            is_testnet: false,
            symbol: "BTCUSDC".to_string(),
            side: Side::Long,
            quantity: dec!(0.0010),
            status: OrderStatus::Executed,
            entry_price: dec!(91000),
            max_entry: dec!(92000),
            take_profit: None,
            stop_loss: None,
            entry_interval: Interval::M5,
            stop_interval: Interval::M5,
            executed_price: Some(dec!(91450)),
            executed_at: None,
            closed_at: None,
            cancel_reason: None,
            tp_order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let at = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).unwrap();
        let msg = transition_message(&order, "EXECUTED", Some(dec!(91450)), at);
        assert!(msg.contains("order #42"));
        assert!(msg.contains("BTCUSDC"));
        assert!(msg.contains("EXECUTED"));
        assert!(msg.contains("qty=0.001"));
        assert!(msg.contains("price=91450"));
    }
}
