//! Gateway proxy to the order service.

use crate::error::ApiError;
use crate::extractors::CorrelationId;
use crate::middleware::CORRELATION_ID_HEADER;
use crate::state::GatewayState;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};

/// Forward an order request to the order service.
///
/// ```text
/// POST /api/orders
/// ```
///
/// The body is forwarded as-is together with the correlation ID. A successful
/// answer is relayed with its status code and JSON body.
///
/// # Errors
///
/// Returns a 500 `Internal forwarding failed` error if the order service
/// cannot be reached, answers with a non-success status (its body becomes the
/// message), or does not answer with JSON.
pub async fn forward_order(
    State(state): State<GatewayState>,
    CorrelationId(correlation_id): CorrelationId,
    body: Bytes,
) -> Result<Response, ApiError> {
    let url = state.orders_url();

    let response = state
        .client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .header(CORRELATION_ID_HEADER, correlation_id.to_string())
        .body(body)
        .send()
        .await
        .map_err(|e| {
            metrics::counter!("gateway_forward_failures_total").increment(1);
            tracing::warn!(%correlation_id, url = %url, error = %e, "Order service unreachable");
            ApiError::forwarding(e.to_string()).with_source(e.into())
        })?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        metrics::counter!("gateway_forward_failures_total").increment(1);
        tracing::warn!(%correlation_id, %status, "Order service rejected the request");
        return Err(ApiError::forwarding(format!(
            "Order service responded with {status}: {detail}"
        )));
    }

    let payload: serde_json::Value = response.json().await.map_err(|e| {
        metrics::counter!("gateway_forward_failures_total").increment(1);
        tracing::warn!(%correlation_id, %status, error = %e, "Order service returned a non-JSON body");
        ApiError::forwarding(e.to_string()).with_source(e.into())
    })?;

    metrics::counter!("gateway_forwarded_total", "status" => status.as_u16().to_string())
        .increment(1);
    tracing::debug!(%correlation_id, %status, "Order request forwarded");
    Ok((status, Json(payload)).into_response())
}
