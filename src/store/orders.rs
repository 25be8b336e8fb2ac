//! Durable order store over SQLite.
//!
//! All status changes funnel through [`OrderRepository::atomic_transition`]:
//! a compare-and-swap on the status column that either applies the whole
//! mutation or reports [`StoreError::Conflict`] without writing. That
//! single mechanism is what makes IN_EXECUTION a real critical section
//! across parallel workers and across processes.
//!
//! Monetary columns are stored as TEXT and converted to [`Decimal`] at
//! this boundary; SQLite has no decimal affinity and floats are not
//! allowed on value-carrying paths.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

use crate::types::{
    Interval, NewOrder, Order, OrderFilter, OrderPatch, OrderStatus, Side, SplitParams,
};

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// The compare-and-swap precondition failed: another worker moved
    /// the order first.
    #[error("order {id}: status is no longer {expected:?}")]
    Conflict { id: i64, expected: OrderStatus },

    /// The order exists but user edits are not allowed in its status.
    #[error("order {id}: not editable in status {status:?}")]
    NotEditable { id: i64, status: OrderStatus },

    #[error("row {0} not found")]
    NotFound(i64),

    #[error("corrupt value in column {column} of order {id}")]
    Corrupt { id: i64, column: &'static str },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

// ─────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL,
    exchange_id    INTEGER NOT NULL,
    api_key_id     INTEGER NOT NULL,
    is_testnet     INTEGER NOT NULL DEFAULT 0,
    symbol         TEXT    NOT NULL,
    side           TEXT    NOT NULL DEFAULT 'LONG',
    quantity       TEXT    NOT NULL,
    status         TEXT    NOT NULL,
    entry_price    TEXT    NOT NULL,
    max_entry      TEXT    NOT NULL,
    take_profit    TEXT,
    stop_loss      TEXT,
    entry_interval TEXT    NOT NULL,
    stop_interval  TEXT    NOT NULL,
    executed_price TEXT,
    executed_at    TEXT,
    closed_at      TEXT,
    cancel_reason  TEXT,
    tp_order_id    TEXT,
    created_at     TEXT    NOT NULL,
    updated_at     TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);

CREATE TABLE IF NOT EXISTS exchanges (
    id   INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS api_keys (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    exchange_id   INTEGER NOT NULL,
    api_key_ct    TEXT    NOT NULL,
    secret_key_ct TEXT    NOT NULL,
    is_testnet    INTEGER NOT NULL DEFAULT 0,
    name          TEXT,
    created_at    TEXT    NOT NULL
);
"#;

/// Open (and create if missing) the SQLite database at `url`.
pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(sqlx::Error::from)?
        .create_if_missing(true);
    Ok(SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?)
}

// ─────────────────────────────────────────────────────────
// Transition patch
// ─────────────────────────────────────────────────────────

/// Mutation applied together with a status change. Fields left as `None`
/// keep their stored value; `tp_order_id` distinguishes "keep"
/// (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub executed_price: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub tp_order_id: Option<Option<String>>,
}

impl TransitionPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn executed(price: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            executed_price: Some(price),
            executed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn closed(at: DateTime<Utc>) -> Self {
        Self {
            closed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn cancelled(at: DateTime<Utc>, reason: &str) -> Self {
        Self {
            closed_at: Some(at),
            cancel_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_tp(mut self, tp_order_id: Option<String>) -> Self {
        self.tp_order_id = Some(tp_order_id);
        self
    }
}

// ─────────────────────────────────────────────────────────
// User-edit statement
// ─────────────────────────────────────────────────────────

/// Shared SET clause for user edits; only the status guard differs
/// between the direct path and the critical-section path.
macro_rules! const_edit_sql {
    ($guard:literal) => {
        concat!(
            "UPDATE orders SET
                entry_price    = COALESCE(?, entry_price),
                max_entry      = COALESCE(?, max_entry),
                take_profit    = CASE WHEN ? THEN ? ELSE take_profit END,
                stop_loss      = CASE WHEN ? THEN ? ELSE stop_loss END,
                entry_interval = COALESCE(?, entry_interval),
                stop_interval  = COALESCE(?, stop_interval),
                tp_order_id    = CASE WHEN ? THEN ? ELSE tp_order_id END,
                status         = COALESCE(?, status),
                updated_at     = ?
             WHERE id = ? AND ",
            $guard
        )
    };
}

fn bind_edit<'q>(
    sql: &'q str,
    patch: &'q OrderPatch,
    tp_order_id: Option<Option<String>>,
    restore: Option<OrderStatus>,
    now: DateTime<Utc>,
    id: i64,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let (tp_touch, tp_value) = match &patch.take_profit {
        Some(value) => (true, value.map(|d| d.to_string())),
        None => (false, None),
    };
    let (sl_touch, sl_value) = match &patch.stop_loss {
        Some(value) => (true, value.map(|d| d.to_string())),
        None => (false, None),
    };
    let (tp_id_touch, tp_id_value) = match tp_order_id {
        Some(value) => (true, value),
        None => (false, None),
    };
    sqlx::query(sql)
        .bind(patch.entry_price.map(|d| d.to_string()))
        .bind(patch.max_entry.map(|d| d.to_string()))
        .bind(tp_touch)
        .bind(tp_value)
        .bind(sl_touch)
        .bind(sl_value)
        .bind(patch.entry_interval.map(|i| i.as_str()))
        .bind(patch.stop_interval.map(|i| i.as_str()))
        .bind(tp_id_touch)
        .bind(tp_id_value)
        .bind(restore.map(|s| s.as_str()))
        .bind(now)
        .bind(id)
}

// ─────────────────────────────────────────────────────────
// Repository
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert(
        &self,
        plan: &NewOrder,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let result = sqlx::query(
            "INSERT INTO orders
               (user_id, exchange_id, api_key_id, is_testnet, symbol, side, quantity, status,
                entry_price, max_entry, take_profit, stop_loss, entry_interval, stop_interval,
                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(plan.user_id)
        .bind(plan.exchange_id)
        .bind(plan.api_key_id)
        .bind(plan.is_testnet)
        .bind(&plan.symbol)
        .bind(Side::Long.as_str())
        .bind(plan.quantity.to_string())
        .bind(status.as_str())
        .bind(plan.entry_price.to_string())
        .bind(plan.max_entry.to_string())
        .bind(plan.take_profit.map(|d| d.to_string()))
        .bind(plan.stop_loss.map(|d| d.to_string()))
        .bind(plan.entry_interval.as_str())
        .bind(plan.stop_interval.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.load(result.last_insert_rowid()).await
    }

    pub async fn load(&self, id: i64) -> Result<Order, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        row_to_order(&row)
    }

    /// Orders still owned by the engine: PENDING, IN_EXECUTION, EXECUTED.
    pub async fn list_non_terminal(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM orders
             WHERE status IN ('PENDING', 'IN_EXECUTION', 'EXECUTED')
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn list_filtered(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut sql = String::from("SELECT * FROM orders WHERE 1=1");
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.exchange_id.is_some() {
            sql.push_str(" AND exchange_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(user_id) = filter.user_id {
            query = query.bind(user_id);
        }
        if let Some(exchange_id) = filter.exchange_id {
            query = query.bind(exchange_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_order).collect()
    }

    /// IN_EXECUTION rows whose last touch predates `cutoff` — crashed or
    /// wedged workers, swept by reconciliation.
    pub async fn stale_in_execution(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status = 'IN_EXECUTION' AND updated_at < ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    /// Compare-and-swap status change. Applies `patch` and moves the
    /// order to `next` only if the stored status still equals
    /// `expected`; otherwise nothing is written and `Conflict` is
    /// returned. This is the sole mechanism for status changes.
    pub async fn atomic_transition(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
        patch: TransitionPatch,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        debug_assert!(!expected.is_terminal(), "terminal orders are write-once");
        let (tp_touch, tp_value) = match &patch.tp_order_id {
            Some(value) => (true, value.clone()),
            None => (false, None),
        };
        let result = sqlx::query(
            "UPDATE orders SET
                status         = ?,
                updated_at     = ?,
                executed_price = COALESCE(?, executed_price),
                executed_at    = COALESCE(?, executed_at),
                closed_at      = COALESCE(?, closed_at),
                cancel_reason  = COALESCE(?, cancel_reason),
                tp_order_id    = CASE WHEN ? THEN ? ELSE tp_order_id END
             WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(patch.executed_price.map(|d| d.to_string()))
        .bind(patch.executed_at)
        .bind(patch.closed_at)
        .bind(patch.cancel_reason)
        .bind(tp_touch)
        .bind(tp_value)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "gone" from "someone else has it".
            let current = sqlx::query("SELECT status FROM orders WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            return match current {
                None => Err(StoreError::NotFound(id)),
                Some(_) => Err(StoreError::Conflict { id, expected }),
            };
        }
        self.load(id).await
    }

    /// Direct user edit of an order nobody is working on. Guarded to
    /// non-terminal, non-IN_EXECUTION rows in a single statement.
    pub async fn patch(
        &self,
        id: i64,
        patch: &OrderPatch,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        const SQL: &str = const_edit_sql!("status IN ('PENDING', 'EXECUTED')");
        let result = bind_edit(SQL, patch, None, None, now, id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.load(id).await {
                Ok(order) => Err(StoreError::NotEditable {
                    id,
                    status: order.status,
                }),
                Err(e) => Err(e),
            };
        }
        self.load(id).await
    }

    /// Commit a user edit performed under the critical section: write
    /// the edited fields, optionally swap the TP order id, and restore
    /// the pre-edit status in one statement.
    pub async fn commit_edit(
        &self,
        id: i64,
        patch: &OrderPatch,
        tp_order_id: Option<Option<String>>,
        restore: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        const SQL: &str = const_edit_sql!("status = 'IN_EXECUTION'");
        let result = bind_edit(SQL, patch, tp_order_id, Some(restore), now, id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id,
                expected: OrderStatus::InExecution,
            });
        }
        self.load(id).await
    }

    /// Carve an executed order into two. Runs in one transaction: the
    /// original keeps `keep_qty` with the first TP/SL pair, the new row
    /// takes `split_qty` with the second, and both share the original
    /// execution price and timestamp. The original must be held
    /// IN_EXECUTION by the caller; its status is restored to EXECUTED
    /// here.
    pub async fn split_executed(
        &self,
        original: &Order,
        params: &SplitParams,
        tp1_order_id: Option<String>,
        tp2_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Order, Order), StoreError> {
        let keep_qty = original.quantity - params.split_qty;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE orders SET
                status = 'EXECUTED', quantity = ?, take_profit = ?, stop_loss = ?,
                tp_order_id = ?, updated_at = ?
             WHERE id = ? AND status = 'IN_EXECUTION'",
        )
        .bind(keep_qty.to_string())
        .bind(params.tp1.map(|d| d.to_string()))
        .bind(params.sl1.map(|d| d.to_string()))
        .bind(tp1_order_id)
        .bind(now)
        .bind(original.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id: original.id,
                expected: OrderStatus::InExecution,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO orders
               (user_id, exchange_id, api_key_id, is_testnet, symbol, side, quantity, status,
                entry_price, max_entry, take_profit, stop_loss, entry_interval, stop_interval,
                executed_price, executed_at, tp_order_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'EXECUTED', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(original.user_id)
        .bind(original.exchange_id)
        .bind(original.api_key_id)
        .bind(original.is_testnet)
        .bind(&original.symbol)
        .bind(original.side.as_str())
        .bind(params.split_qty.to_string())
        .bind(original.entry_price.to_string())
        .bind(original.max_entry.to_string())
        .bind(params.tp2.map(|d| d.to_string()))
        .bind(params.sl2.map(|d| d.to_string()))
        .bind(original.entry_interval.as_str())
        .bind(original.stop_interval.as_str())
        .bind(original.executed_price.map(|d| d.to_string()))
        .bind(original.executed_at)
        .bind(tp2_order_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let new_id = inserted.last_insert_rowid();

        tx.commit().await?;
        Ok((self.load(original.id).await?, self.load(new_id).await?))
    }
}

// ─────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────

fn row_to_order(row: &SqliteRow) -> Result<Order, StoreError> {
    let id: i64 = row.try_get("id")?;

    let dec = |column: &'static str| -> Result<Decimal, StoreError> {
        let raw: String = row.try_get(column)?;
        raw.parse().map_err(|_| StoreError::Corrupt { id, column })
    };
    let opt_dec = |column: &'static str| -> Result<Option<Decimal>, StoreError> {
        let raw: Option<String> = row.try_get(column)?;
        raw.map(|s| s.parse().map_err(|_| StoreError::Corrupt { id, column }))
            .transpose()
    };

    let status_raw: String = row.try_get("status")?;
    let status = OrderStatus::parse(&status_raw).ok_or(StoreError::Corrupt {
        id,
        column: "status",
    })?;
    let side_raw: String = row.try_get("side")?;
    let side = Side::parse(&side_raw).ok_or(StoreError::Corrupt { id, column: "side" })?;
    let entry_interval_raw: String = row.try_get("entry_interval")?;
    let entry_interval = Interval::parse(&entry_interval_raw).ok_or(StoreError::Corrupt {
        id,
        column: "entry_interval",
    })?;
    let stop_interval_raw: String = row.try_get("stop_interval")?;
    let stop_interval = Interval::parse(&stop_interval_raw).ok_or(StoreError::Corrupt {
        id,
        column: "stop_interval",
    })?;

    Ok(Order {
        id,
        user_id: row.try_get("user_id")?,
        exchange_id: row.try_get("exchange_id")?,
        api_key_id: row.try_get("api_key_id")?,
        is_testnet: row.try_get("is_testnet")?,
        symbol: row.try_get("symbol")?,
        side,
        quantity: dec("quantity")?,
        status,
        entry_price: dec("entry_price")?,
        max_entry: dec("max_entry")?,
        take_profit: opt_dec("take_profit")?,
        stop_loss: opt_dec("stop_loss")?,
        entry_interval,
        stop_interval,
        executed_price: opt_dec("executed_price")?,
        executed_at: row.try_get("executed_at")?,
        closed_at: row.try_get("closed_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        tp_order_id: row.try_get("tp_order_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn mem_repo() -> OrderRepository {
        // Single connection so every query sees the same :memory: db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let repo = OrderRepository::new(pool);
        repo.migrate().await.expect("schema");
        repo
    }

    fn plan() -> NewOrder {
        NewOrder {
            user_id: 7,
            exchange_id: 1,
            api_key_id: 3,
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

    #[tokio::test]
    async fn test_insert_load_roundtrip() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();

        let loaded = repo.load(order.id).await.unwrap();
        assert_eq!(loaded.symbol, "BTCUSDC");
        assert_eq!(loaded.quantity, dec!(0.001));
        assert_eq!(loaded.take_profit, Some(dec!(95000)));
        assert_eq!(loaded.status, OrderStatus::Pending);
        assert_eq!(loaded.entry_interval, Interval::M5);
        assert!(loaded.executed_price.is_none());
    }

    #[tokio::test]
    async fn test_atomic_transition_and_conflict() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();

        // Pending -> InExecution succeeds
        let order = repo
            .atomic_transition(
                order.id,
                OrderStatus::Pending,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::InExecution);

        // A second worker expecting Pending loses the race
        let err = repo
            .atomic_transition(
                order.id,
                OrderStatus::Pending,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Completing the buy records execution state atomically
        let order = repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Executed,
                TransitionPatch::executed(dec!(91450), now).with_tp(Some("X1".to_string())),
                now,
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.executed_price, Some(dec!(91450)));
        assert_eq!(order.tp_order_id, Some("X1".to_string()));
    }

    #[tokio::test]
    async fn test_terminal_is_write_once() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();
        repo.atomic_transition(
            order.id,
            OrderStatus::Pending,
            OrderStatus::Cancelled,
            TransitionPatch::cancelled(now, "user"),
            now,
        )
        .await
        .unwrap();

        // No expected-status matches a cancelled order any more
        let err = repo
            .atomic_transition(
                order.id,
                OrderStatus::Pending,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // ...and user edits bounce too
        let edit = OrderPatch {
            entry_price: Some(dec!(1)),
            ..OrderPatch::default()
        };
        let err = repo.patch(order.id, &edit, now).await.unwrap_err();
        assert!(matches!(err, StoreError::NotEditable { .. }));
    }

    #[tokio::test]
    async fn test_patch_refuses_in_execution() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();
        repo.atomic_transition(
            order.id,
            OrderStatus::Pending,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            now,
        )
        .await
        .unwrap();

        let edit = OrderPatch {
            max_entry: Some(dec!(93000)),
            ..OrderPatch::default()
        };
        let err = repo.patch(order.id, &edit, now).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotEditable {
                status: OrderStatus::InExecution,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_patch_applies_and_clears_fields() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();

        let edit = OrderPatch {
            entry_price: Some(dec!(90500)),
            stop_loss: Some(None), // clear SL
            entry_interval: Some(Interval::H1),
            ..OrderPatch::default()
        };
        let updated = repo.patch(order.id, &edit, now).await.unwrap();
        assert_eq!(updated.entry_price, dec!(90500));
        assert_eq!(updated.stop_loss, None);
        assert_eq!(updated.entry_interval, Interval::H1);
        // untouched
        assert_eq!(updated.take_profit, Some(dec!(95000)));
    }

    #[tokio::test]
    async fn test_list_non_terminal_and_stale() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let a = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();
        let b = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();
        repo.atomic_transition(
            b.id,
            OrderStatus::Pending,
            OrderStatus::Cancelled,
            TransitionPatch::cancelled(now, "user"),
            now,
        )
        .await
        .unwrap();

        let open = repo.list_non_terminal().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, a.id);

        // Stale sweep: IN_EXECUTION older than cutoff
        let long_ago = now - ChronoDuration::minutes(10);
        repo.atomic_transition(
            a.id,
            OrderStatus::Pending,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            long_ago,
        )
        .await
        .unwrap();
        let stale = repo
            .stale_in_execution(now - ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a.id);
    }

    #[tokio::test]
    async fn test_split_is_transactional() {
        let repo = mem_repo().await;
        let now = Utc::now();
        let order = repo.insert(&plan(), OrderStatus::Pending, now).await.unwrap();
        repo.atomic_transition(
            order.id,
            OrderStatus::Pending,
            OrderStatus::InExecution,
            TransitionPatch::none(),
            now,
        )
        .await
        .unwrap();
        let order = repo
            .atomic_transition(
                order.id,
                OrderStatus::InExecution,
                OrderStatus::Executed,
                TransitionPatch::executed(dec!(91450), now),
                now,
            )
            .await
            .unwrap();
        // back into the critical section, as ops would before splitting
        let order = repo
            .atomic_transition(
                order.id,
                OrderStatus::Executed,
                OrderStatus::InExecution,
                TransitionPatch::none(),
                now,
            )
            .await
            .unwrap();

        let params = SplitParams {
            split_qty: dec!(0.0004),
            tp1: Some(dec!(95000)),
            sl1: Some(dec!(90000)),
            tp2: Some(dec!(99000)),
            sl2: None,
        };
        let (kept, carved) = repo
            .split_executed(&order, &params, Some("T1".into()), Some("T2".into()), now)
            .await
            .unwrap();

        assert_eq!(kept.status, OrderStatus::Executed);
        assert_eq!(kept.quantity, dec!(0.0006));
        assert_eq!(kept.tp_order_id, Some("T1".to_string()));
        assert_eq!(carved.status, OrderStatus::Executed);
        assert_eq!(carved.quantity, dec!(0.0004));
        assert_eq!(carved.executed_price, order.executed_price);
        assert_eq!(carved.take_profit, Some(dec!(99000)));
        assert_eq!(carved.tp_order_id, Some("T2".to_string()));
    }
}
