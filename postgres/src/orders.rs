//! Order store.

use crate::{corrupt_row, map_sqlx_error};
use chrono::{DateTime, Utc};
use order_pipeline_core::domain::{NewOrder, Order, OrderId, ValidationError};
use order_pipeline_core::record_store::{RecordStore, StoreError, StoreFuture};
use sqlx::PgPool;

const STORE: &str = "orders";

type OrderRow = (i64, String, i32, f64, DateTime<Utc>);

/// Orders table, owned by the order service.
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    /// Create a store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `orders` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS orders (
                id BIGSERIAL PRIMARY KEY,
                product TEXT NOT NULL CHECK (length(product) > 0),
                quantity INTEGER NOT NULL CHECK (quantity >= 1),
                price DOUBLE PRECISION NOT NULL CHECK (price >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(STORE, e, None))?;
        Ok(())
    }
}

fn into_order((id, product, quantity, price, created_at): OrderRow) -> Result<Order, StoreError> {
    let quantity =
        u32::try_from(quantity).map_err(|_| corrupt_row("quantity", "is negative in storage"))?;
    Ok(Order {
        id: OrderId::new(id),
        product,
        quantity,
        price,
        created_at,
    })
}

impl RecordStore for PgOrderStore {
    type Fields = NewOrder;
    type Record = Order;

    fn create(&self, fields: NewOrder) -> StoreFuture<'_, Order> {
        Box::pin(async move {
            let quantity = i32::try_from(fields.quantity).map_err(|_| {
                StoreError::Validation(ValidationError::Invalid {
                    field: "quantity",
                    reason: "is too large".to_string(),
                })
            })?;

            let row: OrderRow = sqlx::query_as(
                r"
                INSERT INTO orders (product, quantity, price)
                VALUES ($1, $2, $3)
                RETURNING id, product, quantity, price, created_at
                ",
            )
            .bind(&fields.product)
            .bind(quantity)
            .bind(fields.price)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(STORE, e, None))?;

            let order = into_order(row)?;
            tracing::debug!(order_id = %order.id, product = %order.product, "Order inserted");
            Ok(order)
        })
    }

    fn find_by_order_id(&self, order_id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let row: Option<OrderRow> = sqlx::query_as(
                "SELECT id, product, quantity, price, created_at FROM orders WHERE id = $1",
            )
            .bind(order_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(STORE, e, None))?;

            row.map(into_order).transpose()
        })
    }
}
