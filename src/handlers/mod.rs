pub mod transactions;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use utoipa::OpenApi;

use crate::domain::{NewTransaction, Transaction, TransactionStatus};
use crate::health::{check_health, DependencyStatus, HealthResponse};
use crate::resilience::{BreakerSnapshot, BreakerState};
use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        transactions::create_transaction,
        transactions::list_transactions,
        transactions::get_transaction
    ),
    components(schemas(
        NewTransaction,
        Transaction,
        TransactionStatus,
        HealthResponse,
        DependencyStatus,
        BreakerSnapshot,
        BreakerState
    )),
    tags(
        (name = "Transactions", description = "Transaction admission and lookup"),
        (name = "Health", description = "Service health")
    )
)]
pub struct ApiDoc;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy or degraded", body = HealthResponse),
        (status = 503, description = "A dependency is unreachable", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = check_health(
        &state.health_checkers,
        state.breakers.snapshots(),
        state.started_at,
    )
    .await;

    // Return 503 if a dependency is down, 200 otherwise
    let status_code = if health.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(health))
}

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
