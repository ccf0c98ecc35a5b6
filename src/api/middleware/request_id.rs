use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client supplied ids longer than this are replaced with a fresh one
const MAX_REQUEST_ID_LEN: usize = 128;

/// Reuses the caller's `x-request-id` or mints one, and echoes it on the response.
///
/// The id is also recorded as `request_id` on the enclosing span, when that
/// span declares the field.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);

    let request_id = req
        .headers()
        .get(&header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| {
            // A UUID is always a valid header value
            HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or(HeaderValue::from_static("unknown"))
        });

    if let Ok(id) = request_id.to_str() {
        tracing::Span::current().record("request_id", id);
    }
    req.headers_mut().insert(header.clone(), request_id.clone());

    let mut response = next.run(req).await;
    response.headers_mut().insert(header, request_id);
    response
}
