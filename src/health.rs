use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use utoipa::ToSchema;

use crate::ports::{EventBus, TransactionStore};
use crate::resilience::{BreakerSnapshot, BreakerState};

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: BTreeMap<String, DependencyStatus>,
    pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

impl DependencyStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, DependencyStatus::Healthy { .. })
    }

    fn from_result<E: std::fmt::Display>(started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: e.to_string(),
            },
        }
    }

    fn timed_out() -> Self {
        DependencyStatus::Unhealthy {
            status: "unhealthy".to_string(),
            error: format!("check timed out after {:?}", CHECK_TIMEOUT),
        }
    }
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> DependencyStatus;
}

pub struct StoreChecker {
    store: Arc<dyn TransactionStore>,
}

impl StoreChecker {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyChecker for StoreChecker {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match timeout(CHECK_TIMEOUT, self.store.ping()).await {
            Ok(result) => DependencyStatus::from_result(start, result),
            Err(_) => DependencyStatus::timed_out(),
        }
    }
}

pub struct BusChecker {
    bus: Arc<dyn EventBus>,
}

impl BusChecker {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DependencyChecker for BusChecker {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match timeout(CHECK_TIMEOUT, self.bus.ping()).await {
            Ok(result) => DependencyStatus::from_result(start, result),
            Err(_) => DependencyStatus::timed_out(),
        }
    }
}

/// Runs every checker and folds the results with the breaker states.
/// An open breaker degrades the service but does not make it unhealthy.
pub async fn check_health(
    checkers: &[Arc<dyn DependencyChecker>],
    breakers: Vec<BreakerSnapshot>,
    started_at: Instant,
) -> HealthResponse {
    let mut dependencies = BTreeMap::new();
    for checker in checkers {
        dependencies.insert(checker.name().to_string(), checker.check().await);
    }

    let status = if !dependencies.values().all(DependencyStatus::is_healthy) {
        "unhealthy"
    } else if breakers.iter().any(|b| b.state != BreakerState::Closed) {
        "degraded"
    } else {
        "healthy"
    };

    HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: started_at.elapsed().as_secs(),
        dependencies,
        breakers,
    }
}
