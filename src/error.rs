use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::TransactionStatus;
use crate::ports::RepositoryError;
use crate::resilience::PolicyError;
use crate::validation::ValidationError;

/// Failures of the transaction processing core.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Owner account {0} is disabled")]
    InvalidOwnerState(Uuid),

    #[error("Transaction amount must be greater than zero")]
    InvalidAmount,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Transaction not found: {0}")]
    NotFound(Uuid),

    #[error("Capacity exceeded, retry later")]
    CapacityExceeded,

    #[error("Dependency failure: {0}")]
    Dependency(String),
}

impl ProcessingError {
    /// Whether the caller may succeed by retrying the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessingError::CapacityExceeded | ProcessingError::Dependency(_)
        )
    }
}

impl From<RepositoryError> for ProcessingError {
    fn from(e: RepositoryError) -> Self {
        ProcessingError::Dependency(e.to_string())
    }
}

impl From<PolicyError<RepositoryError>> for ProcessingError {
    fn from(e: PolicyError<RepositoryError>) -> Self {
        match e {
            PolicyError::Inner(inner) => inner.into(),
            other => ProcessingError::Dependency(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Dependency failure: {0}")]
    Dependency(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl From<ProcessingError> for AppError {
    fn from(e: ProcessingError) -> Self {
        match e {
            ProcessingError::InvalidOwnerState(_)
            | ProcessingError::InvalidAmount
            | ProcessingError::Validation(_) => AppError::Validation(e.to_string()),
            ProcessingError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            ProcessingError::NotFound(id) => {
                AppError::NotFound(format!("Transaction {} not found", id))
            }
            ProcessingError::CapacityExceeded => AppError::TooManyRequests(e.to_string()),
            ProcessingError::Dependency(msg) => AppError::Dependency(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
