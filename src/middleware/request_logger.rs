use axum::{
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tags each request with an id (the caller's, when it sent a usable one),
/// logs request and response with latency, and echoes the id back.
pub async fn request_logger_middleware<B>(mut req: Request<B>, next: Next<B>) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
        });
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    req.headers_mut()
        .insert(REQUEST_ID_HEADER, request_id.clone());

    let id = request_id.to_str().unwrap_or("invalid");
    tracing::info!(
        request_id = %id,
        method = %method,
        uri = %uri,
        "Incoming request"
    );

    let mut response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status();
    tracing::info!(
        request_id = %id,
        method = %method,
        uri = %uri,
        status = %status.as_u16(),
        latency_ms = latency.as_millis(),
        "Outgoing response"
    );

    response
        .headers_mut()
        .insert(REQUEST_ID_HEADER, request_id.clone());
    response
}
