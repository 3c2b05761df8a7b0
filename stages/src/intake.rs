//! Order intake.
//!
//! [`OrderIntake`] validates an order request, persists the order and emits
//! the pipeline's first event. [`OrderService`] drives it for the HTTP
//! boundary and reports failures as [`IntakeError`]s the caller can map to
//! status codes.

use order_pipeline_core::domain::{NewOrder, Order, OrderRequest, ValidationError};
use order_pipeline_core::event::{DomainEvent, Envelope};
use order_pipeline_core::handler::Stage;
use order_pipeline_core::record_store::{RecordStore, StoreError};
use order_pipeline_runtime::publisher::{PublishError, Publisher};
use order_pipeline_runtime::stage::{StageError, run_stage};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Record store for orders.
pub type OrderStore = dyn RecordStore<Fields = NewOrder, Record = Order>;

/// Validates order requests and creates orders.
#[derive(Clone)]
pub struct OrderIntake {
    store: Arc<OrderStore>,
}

impl fmt::Debug for OrderIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderIntake").finish_non_exhaustive()
    }
}

impl OrderIntake {
    /// Create the stage over `store`.
    #[must_use]
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

impl Stage for OrderIntake {
    const NAME: &'static str = "order_intake";
    const TERMINAL: bool = false;

    type Input = OrderRequest;
    type Validated = NewOrder;
    type Record = Order;

    fn validate(&self, input: OrderRequest) -> Result<NewOrder, ValidationError> {
        input.validate()
    }

    fn apply(
        &self,
        validated: NewOrder,
    ) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>> {
        self.store.create(validated)
    }

    fn next_event(&self, record: &Order) -> Option<DomainEvent> {
        Some(DomainEvent::OrderCreated(record.clone()))
    }
}

/// Failure to place an order.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The request failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The order store could not be reached.
    #[error("Order store unavailable: {0}")]
    StoreUnavailable(String),

    /// The order was stored but `order_created` could not be published.
    #[error("Order could not be handed to the pipeline: {0}")]
    PublishUnavailable(String),

    /// Any other failure.
    #[error("Order intake failed: {0}")]
    Internal(String),
}

impl From<StageError> for IntakeError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Validation(e) | StageError::Store(StoreError::Validation(e)) => {
                Self::Validation(e)
            },
            StageError::Store(e) => Self::StoreUnavailable(e.to_string()),
            StageError::Publish(
                e @ (PublishError::Unavailable { .. } | PublishError::Closed),
            ) => Self::PublishUnavailable(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// An order that was stored and handed to the pipeline.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    /// The stored order
    pub order: Order,
    /// The published `order_created` envelope
    pub envelope: Envelope,
}

/// Order intake for the HTTP boundary.
#[derive(Debug, Clone)]
pub struct OrderService {
    stage: OrderIntake,
    publisher: Arc<Publisher>,
}

impl OrderService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<OrderStore>, publisher: Arc<Publisher>) -> Self {
        Self {
            stage: OrderIntake::new(store),
            publisher,
        }
    }

    /// Validate, persist and publish an order.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError`]. A publish failure leaves the stored order in
    /// place; it is logged with its id.
    pub async fn place_order(&self, request: OrderRequest) -> Result<PlacedOrder, IntakeError> {
        let (order, envelope) = run_stage(&self.stage, Some(self.publisher.as_ref()), request, None)
            .await
            .map_err(|e| {
                match &e {
                    StageError::Validation(v) => {
                        tracing::debug!(field = v.field(), error = %v, "Order request rejected");
                    },
                    StageError::Publish(p) => {
                        tracing::error!(error = %p, "Order stored but order_created was not published");
                    },
                    _ => tracing::warn!(error = %e, "Order intake failed"),
                }
                IntakeError::from(e)
            })?;

        let envelope = envelope.ok_or_else(|| {
            IntakeError::Internal("order intake produced no order_created event".to_string())
        })?;

        metrics::counter!("pipeline_orders_placed_total").increment(1);
        tracing::info!(
            order_id = %order.id,
            message_id = %envelope.message_id,
            product = %order.product,
            "Order placed"
        );
        Ok(PlacedOrder { order, envelope })
    }
}
