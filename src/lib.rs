pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod resilience;
pub mod services;
pub mod startup;
pub mod validation;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post, MethodRouter},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::health::DependencyChecker;
use crate::ports::OwnerDirectory;
use crate::resilience::{BreakerRegistry, TimeoutPolicy};
use crate::services::{AdmissionController, TransactionProcessor};

#[derive(Clone)]
pub struct AppState {
    pub processor: TransactionProcessor,
    pub owners: Arc<dyn OwnerDirectory>,
    pub admission: Arc<AdmissionController>,
    pub breakers: Arc<BreakerRegistry>,
    pub health_checkers: Arc<Vec<Arc<dyn DependencyChecker>>>,
    pub store_timeout: TimeoutPolicy,
    pub started_at: Instant,
}

pub fn create_app(state: AppState, allowed_origins: &[String]) -> Router {
    // Admission control guards transaction creation only
    let create: MethodRouter<AppState> = post(handlers::transactions::create_transaction).layer(
        axum_middleware::from_fn_with_state(
            state.admission.clone(),
            middleware::admission::admission_middleware,
        ),
    );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .route(
            "/transactions",
            create.get(handlers::transactions::list_transactions),
        )
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .layer(axum_middleware::from_fn(
            middleware::request_logger::request_logger_middleware,
        ))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(handlers::transactions::OWNER_HEADER),
        ]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
