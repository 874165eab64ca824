use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// A response carrying only `status` and its reason phrase, the way clients
/// under test see a plain upstream error.
pub fn status_text(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("");
    let mut response = (status, format!("{}\n", reason)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// An empty `204 No Content`.
pub fn accepted() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_status_text_body() {
        let response = status_text(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Too Many Requests\n");
    }

    #[tokio::test]
    async fn test_accepted_is_empty() {
        let response = accepted();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
