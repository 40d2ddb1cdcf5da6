use axum::{
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::{AppError, ProcessingError};
use crate::services::AdmissionController;

/// Rejects with 429 when the admission bucket is empty. Never queues.
pub async fn admission_middleware<B>(
    State(admission): State<Arc<AdmissionController>>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    if !admission.try_admit() {
        tracing::warn!(
            method = %req.method(),
            uri = %req.uri(),
            "Request rejected by admission control"
        );
        return AppError::from(ProcessingError::CapacityExceeded).into_response();
    }
    next.run(req).await
}
