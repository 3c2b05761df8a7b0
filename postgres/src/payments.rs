//! Payment store.

use crate::map_sqlx_error;
use order_pipeline_core::domain::{NewPayment, OrderId, Payment, PaymentStatus};
use order_pipeline_core::record_store::{RecordStore, StoreError, StoreFuture};
use sqlx::PgPool;

const STORE: &str = "payments";

/// Payments table, owned by the payment service. Unique by `order_id`.
#[derive(Debug, Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
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

    /// Create the `payments` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS payments (
                id BIGSERIAL PRIMARY KEY,
                order_id BIGINT NOT NULL UNIQUE,
                status TEXT NOT NULL CHECK (status IN ('paid', 'failed', 'pending')),
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

impl RecordStore for PgPaymentStore {
    type Fields = NewPayment;
    type Record = Payment;

    fn create(&self, fields: NewPayment) -> StoreFuture<'_, Payment> {
        Box::pin(async move {
            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO payments (order_id, status) VALUES ($1, $2) RETURNING id",
            )
            .bind(fields.order_id.value())
            .bind(fields.status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(STORE, e, Some(fields.order_id)))?;

            tracing::debug!(payment_id = id, order_id = %fields.order_id, status = %fields.status, "Payment inserted");
            Ok(Payment {
                id,
                order_id: fields.order_id,
                status: fields.status,
            })
        })
    }

    fn find_by_order_id(&self, order_id: OrderId) -> StoreFuture<'_, Option<Payment>> {
        Box::pin(async move {
            let row: Option<(i64, String)> =
                sqlx::query_as("SELECT id, status FROM payments WHERE order_id = $1")
                    .bind(order_id.value())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(STORE, e, None))?;

            row.map(|(id, status)| {
                Ok(Payment {
                    id,
                    order_id,
                    status: PaymentStatus::parse(&status)?,
                })
            })
            .transpose()
        })
    }
}
