//! Notification stage: records each completed payment exactly once.

use order_pipeline_core::domain::{PaymentCompleted, PaymentLog, ValidationError};
use order_pipeline_core::event::DomainEvent;
use order_pipeline_core::handler::Stage;
use order_pipeline_core::record_store::{Created, RecordStore, StoreError, find_or_create};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Record store for payment logs. Append-only, unique by `order_id`.
pub type PaymentLogStore = dyn RecordStore<Fields = PaymentCompleted, Record = PaymentLog>;

/// Terminal stage writing one [`PaymentLog`] per order.
pub struct NotificationStage {
    store: Arc<PaymentLogStore>,
}

impl fmt::Debug for NotificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationStage").finish_non_exhaustive()
    }
}

impl NotificationStage {
    /// Create the stage over `store`.
    #[must_use]
    pub fn new(store: Arc<PaymentLogStore>) -> Self {
        Self { store }
    }
}

impl Stage for NotificationStage {
    const NAME: &'static str = "notification";
    const TERMINAL: bool = true;

    type Input = PaymentCompleted;
    type Validated = PaymentCompleted;
    type Record = PaymentLog;

    fn validate(&self, input: PaymentCompleted) -> Result<PaymentCompleted, ValidationError> {
        input.check()?;
        Ok(input)
    }

    fn apply(
        &self,
        event: PaymentCompleted,
    ) -> Pin<Box<dyn Future<Output = Result<PaymentLog, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let order_id = event.order_id;
            let (log, created) = find_or_create(self.store.as_ref(), order_id, event).await?;

            if created == Created::Existing {
                metrics::counter!("pipeline_duplicates_suppressed_total", "stage" => Self::NAME)
                    .increment(1);
                tracing::debug!(%order_id, "Payment log already recorded");
            } else {
                tracing::info!(%order_id, status = %log.status, "Payment logged");
            }
            Ok(log)
        })
    }

    fn next_event(&self, _record: &PaymentLog) -> Option<DomainEvent> {
        None
    }
}
