use axum::{
    extract::Request,
    http::{Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub async fn security_headers(req: Request, next: Next) -> Response {
    // Reject TRACE and TRACK (proxy disclosure)
    let method = req.method();
    if method == Method::TRACE || method.as_str() == "TRACK" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Artifacts are downloads, never something to sniff or frame
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        header::HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        header::HeaderValue::from_static("no-referrer"),
    );

    // Suppress fingerprinting
    headers.insert(
        header::SERVER,
        header::HeaderValue::from_static("doc-ops-backend"),
    );

    // Converted documents may be sensitive
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
    }

    response
}
