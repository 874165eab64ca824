use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::health::Readiness;
use crate::response::accepted;

/// Ingest endpoint. The body has to be read to completion so content-length
/// accounting on the client side stays correct; it is then discarded.
pub async fn ingest(body: Bytes) -> Response {
    tracing::trace!(bytes = body.len(), "ingested body");
    accepted()
}

/// `204` once the server is accepting requests, `503` otherwise.
pub async fn health_check(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
