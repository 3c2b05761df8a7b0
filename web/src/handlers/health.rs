//! Liveness endpoint.

use axum::http::StatusCode;

/// Returns 200 OK while the process is serving requests. Does not check the
/// broker or the database.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
