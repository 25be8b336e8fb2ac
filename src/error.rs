//! Engine-surface error taxonomy.
//!
//! Adapter and repository layers carry their own error enums
//! ([`AdapterError`](crate::exchange::AdapterError),
//! [`StoreError`](crate::store::StoreError)); this type is what the
//! hosting application sees from engine operations.

use thiserror::Error;

use crate::exchange::AdapterError;
use crate::store::StoreError;
use crate::types::OrderStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An input plan or edit violates the order invariants. Nothing was
    /// persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("order {0} not found")]
    NotFound(i64),

    /// The operation does not apply to the order's current status
    /// (e.g. cancel on an executed order).
    #[error("order {id} is {status:?}; operation requires {required}")]
    InvalidState {
        id: i64,
        status: OrderStatus,
        required: &'static str,
    },

    /// Another worker holds the order's critical section right now.
    #[error("order {0} is currently being executed; retry shortly")]
    Busy(i64),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}
