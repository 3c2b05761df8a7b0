//! Order intake endpoint.

use crate::error::ApiError;
use crate::extractors::CorrelationId;
use crate::state::OrderServiceState;
use axum::{Json, extract::State, extract::rejection::JsonRejection, http::StatusCode};
use order_pipeline_core::domain::{Order, OrderRequest};

/// Place an order.
///
/// ```text
/// POST /api/orders
/// {"product": "Widget", "quantity": 2, "price": 9.99}
/// ```
///
/// - 201 with the stored order
/// - 422 if the body is not a JSON object or a field fails validation
/// - 503 if the order could not be stored or handed to the pipeline
///
/// # Errors
///
/// Returns [`ApiError`] for every non-201 outcome.
pub async fn create_order(
    State(state): State<OrderServiceState>,
    CorrelationId(correlation_id): CorrelationId,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let Json(request) = payload?;
    let placed = state.orders.place_order(request).await?;

    tracing::info!(
        %correlation_id,
        order_id = %placed.order.id,
        message_id = %placed.envelope.message_id,
        "Order accepted"
    );
    Ok((StatusCode::CREATED, Json(placed.order)))
}
