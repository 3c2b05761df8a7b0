//! Custom Axum extractors.

use crate::middleware::correlation_id_from;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// Correlation ID of the current request.
///
/// Reads the ID stored by
/// [`correlation_id_layer`](crate::middleware::correlation_id_layer), falling
/// back to the `X-Correlation-ID` header and finally to a fresh UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .extensions
            .get::<Uuid>()
            .copied()
            .or_else(|| correlation_id_from(&parts.headers))
            .unwrap_or_else(Uuid::new_v4);
        Ok(Self(id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::middleware::CORRELATION_ID_HEADER;
    use axum::http::Request;

    #[tokio::test]
    async fn extension_wins_over_header() {
        let stored = Uuid::new_v4();
        let (mut parts, ()) = Request::builder()
            .header(CORRELATION_ID_HEADER, Uuid::new_v4().to_string())
            .extension(stored)
            .body(())
            .unwrap()
            .into_parts();

        let CorrelationId(id) = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(id, stored);
    }

    #[tokio::test]
    async fn header_is_used_without_middleware() {
        let sent = Uuid::new_v4();
        let (mut parts, ()) = Request::builder()
            .header(CORRELATION_ID_HEADER, sent.to_string())
            .body(())
            .unwrap()
            .into_parts();

        let CorrelationId(id) = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(id, sent);
    }
}
