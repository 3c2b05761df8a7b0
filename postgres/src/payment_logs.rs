//! Payment-log store.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use order_pipeline_core::domain::{OrderId, PaymentCompleted, PaymentLog, PaymentStatus};
use order_pipeline_core::record_store::{RecordStore, StoreError, StoreFuture};
use sqlx::PgPool;

const STORE: &str = "payment_logs";

/// Payment-log table, owned by the notification service. Append-only and
/// unique by `order_id`.
#[derive(Debug, Clone)]
pub struct PgPaymentLogStore {
    pool: PgPool,
}

impl PgPaymentLogStore {
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

    /// Create the `payment_logs` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS payment_logs (
                id BIGSERIAL PRIMARY KEY,
                order_id BIGINT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                notified_at TIMESTAMPTZ NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(STORE, e, None))?;
        Ok(())
    }
}

impl RecordStore for PgPaymentLogStore {
    type Fields = PaymentCompleted;
    type Record = PaymentLog;

    fn create(&self, fields: PaymentCompleted) -> StoreFuture<'_, PaymentLog> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO payment_logs (order_id, status, notified_at) VALUES ($1, $2, $3)",
            )
            .bind(fields.order_id.value())
            .bind(fields.status.as_str())
            .bind(fields.notified_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(STORE, e, Some(fields.order_id)))?;

            Ok(PaymentLog {
                order_id: fields.order_id,
                status: fields.status,
                notified_at: fields.notified_at,
            })
        })
    }

    fn find_by_order_id(&self, order_id: OrderId) -> StoreFuture<'_, Option<PaymentLog>> {
        Box::pin(async move {
            let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
                "SELECT status, notified_at FROM payment_logs WHERE order_id = $1",
            )
            .bind(order_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(STORE, e, None))?;

            row.map(|(status, notified_at)| {
                Ok(PaymentLog {
                    order_id,
                    status: PaymentStatus::parse(&status)?,
                    notified_at,
                })
            })
            .transpose()
        })
    }
}
