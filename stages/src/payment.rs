//! Payment stage: `order_created` in, `payment_completed` out.

use order_pipeline_core::domain::{
    NewPayment, Order, Payment, PaymentCompleted, PaymentStatus, ValidationError,
};
use order_pipeline_core::environment::{Clock, SystemClock};
use order_pipeline_core::event::DomainEvent;
use order_pipeline_core::handler::Stage;
use order_pipeline_core::record_store::{Created, RecordStore, StoreError, find_or_create};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Record store for payments. Unique by `order_id`.
pub type PaymentStore = dyn RecordStore<Fields = NewPayment, Record = Payment>;

/// Creates one payment per order and reports its completion.
///
/// A redelivered `order_created` finds the existing payment and still emits
/// `payment_completed`.
pub struct PaymentStage {
    store: Arc<PaymentStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PaymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentStage").finish_non_exhaustive()
    }
}

impl PaymentStage {
    /// Create the stage over `store`.
    #[must_use]
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `notified_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Stage for PaymentStage {
    const NAME: &'static str = "payment";
    const TERMINAL: bool = false;

    type Input = Order;
    type Validated = Order;
    type Record = Payment;

    fn validate(&self, input: Order) -> Result<Order, ValidationError> {
        input.check()?;
        Ok(input)
    }

    fn apply(
        &self,
        order: Order,
    ) -> Pin<Box<dyn Future<Output = Result<Payment, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let fields = NewPayment {
                order_id: order.id,
                status: PaymentStatus::Paid,
            };
            let (payment, created) = find_or_create(self.store.as_ref(), order.id, fields).await?;

            match created {
                Created::New => {
                    tracing::info!(order_id = %order.id, payment_id = payment.id, "Payment created");
                },
                Created::Existing => {
                    metrics::counter!("pipeline_duplicates_suppressed_total", "stage" => Self::NAME)
                        .increment(1);
                    tracing::info!(
                        order_id = %order.id,
                        payment_id = payment.id,
                        "Payment already exists, re-emitting completion"
                    );
                },
            }
            Ok(payment)
        })
    }

    fn next_event(&self, payment: &Payment) -> Option<DomainEvent> {
        Some(DomainEvent::PaymentCompleted(PaymentCompleted {
            order_id: payment.order_id,
            status: payment.status,
            notified_at: self.clock.now(),
        }))
    }
}
