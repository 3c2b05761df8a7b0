//! HTTP surface of the order pipeline.
//!
//! Two services share this crate:
//!
//! - **Order service** ([`order_service_router`]): `POST /api/orders`
//!   validates, stores and publishes an order, answering 201 with the order.
//! - **Gateway** ([`gateway_router`]): `POST /api/orders` forwards the request
//!   to the order service and relays its answer.
//!
//! Both expose `GET /health` and tag every request with a correlation ID.
//! Failures are JSON envelopes of the form `{"error": ..., "message": ...}`
//! (see [`ApiError`]).
//!
//! ```ignore
//! let state = OrderServiceState::new(Arc::new(order_service));
//! serve(addr, order_service_router(state), coordinator.signal()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use extractors::CorrelationId;
pub use middleware::{CORRELATION_ID_HEADER, correlation_id_layer};
pub use router::{gateway_router, order_service_router, serve};
pub use state::{GatewayState, OrderServiceState};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, ApiError>;
