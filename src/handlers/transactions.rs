use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    Json,
};
use uuid::Uuid;

use crate::domain::{NewTransaction, Owner, Transaction};
use crate::error::{AppError, ProcessingError};
use crate::AppState;

/// Header carrying the authenticated owner id, set by the upstream gateway.
pub const OWNER_HEADER: &str = "x-owner-id";

async fn resolve_owner(state: &AppState, headers: &HeaderMap) -> Result<Owner, AppError> {
    let raw = headers
        .get(OWNER_HEADER)
        .ok_or_else(|| AppError::Validation(format!("missing {} header", OWNER_HEADER)))?;
    let owner_id = raw
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| AppError::Validation(format!("invalid {} header", OWNER_HEADER)))?;

    let owner = state
        .store_timeout
        .call(state.owners.resolve(owner_id))
        .await
        .map_err(ProcessingError::from)?;

    owner.ok_or_else(|| AppError::Validation(format!("unknown owner {}", owner_id)))
}

#[utoipa::path(
    post,
    path = "/transactions",
    request_body = NewTransaction,
    params(("x-owner-id" = Uuid, Header, description = "Authenticated owner id")),
    responses(
        (status = 200, description = "Transaction created, or the existing one for a repeated reference", body = Transaction),
        (status = 400, description = "Invalid amount, reference or owner"),
        (status = 429, description = "Admission capacity exceeded"),
        (status = 500, description = "Dependency failure")
    ),
    tag = "Transactions"
)]
pub async fn create_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewTransaction>, JsonRejection>,
) -> Result<Json<Transaction>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let owner = resolve_owner(&state, &headers).await?;

    let tx = state.processor.create_transaction(&owner, request).await?;
    Ok(Json(tx))
}

#[utoipa::path(
    get,
    path = "/transactions",
    params(("x-owner-id" = Uuid, Header, description = "Authenticated owner id")),
    responses(
        (status = 200, description = "Transactions visible to the owner, newest first", body = [Transaction]),
        (status = 400, description = "Missing or unknown owner")
    ),
    tag = "Transactions"
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let owner = resolve_owner(&state, &headers).await?;
    let transactions = state.processor.list_for_owner(&owner).await?;
    Ok(Json(transactions))
}

#[utoipa::path(
    get,
    path = "/transactions/{id}",
    params(
        ("id" = Uuid, Path, description = "Transaction id"),
        ("x-owner-id" = Uuid, Header, description = "Authenticated owner id")
    ),
    responses(
        (status = 200, description = "Transaction found", body = Transaction),
        (status = 404, description = "Transaction not found")
    ),
    tag = "Transactions"
)]
pub async fn get_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Transaction>, AppError> {
    let owner = resolve_owner(&state, &headers).await?;
    let tx = state.processor.get_for_owner(&owner, id).await?;
    Ok(Json(tx))
}
