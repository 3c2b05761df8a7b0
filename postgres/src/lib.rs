//! `PostgreSQL` record stores for the order pipeline.
//!
//! Each service owns one store and one table:
//!
//! | Store                | Table          | Uniqueness           |
//! |----------------------|----------------|----------------------|
//! | [`PgOrderStore`]     | `orders`       | `id` (sequence)      |
//! | [`PgPaymentStore`]   | `payments`     | `order_id`           |
//! | [`PgPaymentLogStore`]| `payment_logs` | `order_id`           |
//!
//! The `order_id` unique constraints are what make redelivered events
//! harmless: a duplicate insert fails with a unique violation, surfaced as
//! [`StoreError::Conflict`], and the stage reads the existing row instead.
//!
//! Queries are runtime-checked (`sqlx::query_as`), so the crate builds without
//! a live database.
//!
//! # Example
//!
//! ```ignore
//! use order_pipeline_postgres::{PgPaymentStore, connect};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/payments", 5).await?;
//!     let store = PgPaymentStore::new(pool);
//!     store.ensure_schema().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod orders;
mod payment_logs;
mod payments;

pub use orders::PgOrderStore;
pub use payment_logs::PgPaymentLogStore;
pub use payments::PgPaymentStore;

use order_pipeline_core::domain::{OrderId, ValidationError};
use order_pipeline_core::record_store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// `PostgreSQL` error code for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// `PostgreSQL` error code for check constraint violations.
const CHECK_VIOLATION: &str = "23514";

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    tracing::info!(max_connections, "Database pool ready");
    Ok(pool)
}

/// Map a sqlx error to the store taxonomy.
///
/// `order_id` names the conflicting order when the statement was an insert
/// into an order-keyed table.
fn map_sqlx_error(store: &'static str, error: sqlx::Error, order_id: Option<OrderId>) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => {
                if let Some(order_id) = order_id {
                    metrics::counter!("record_store_conflicts_total", "store" => store).increment(1);
                    return StoreError::Conflict { order_id };
                }
            },
            Some(CHECK_VIOLATION) => {
                return StoreError::Validation(ValidationError::Invalid {
                    field: "record",
                    reason: format!("violates {}", db.constraint().unwrap_or("a check constraint")),
                });
            },
            _ => {},
        }
    }

    metrics::counter!("record_store_errors_total", "store" => store).increment(1);
    tracing::warn!(store, error = %error, "Record store operation failed");
    StoreError::Unavailable(error.to_string())
}

/// A column value that cannot be turned back into a domain value.
fn corrupt_row(field: &'static str, reason: impl Into<String>) -> StoreError {
    StoreError::Validation(ValidationError::Invalid {
        field,
        reason: reason.into(),
    })
}
