//! Wiring of the processing core from configuration and backends.

use anyhow::Context;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::{
    InMemoryEventBus, InMemoryOwnerDirectory, InMemoryTransactionStore, PostgresOwnerDirectory,
    PostgresTransactionRepository, RedisEventBus,
};
use crate::config::Config;
use crate::domain::Owner;
use crate::health::{BusChecker, DependencyChecker, StoreChecker};
use crate::ports::{EventBus, OwnerDirectory, TransactionStore};
use crate::resilience::{BreakerRegistry, ResiliencePolicy};
use crate::services::{
    spawn_listener, AdmissionController, AmountLimitStep, CompensationListener, EventPublisher,
    LoggingRefundHandler, SagaListener, TransactionProcessor,
};
use crate::AppState;

pub const EVENT_BUS_BREAKER: &str = "event-bus";
pub const SAGA_STEP_BREAKER: &str = "saga-step";

pub struct Backends {
    pub store: Arc<dyn TransactionStore>,
    pub owners: Arc<dyn OwnerDirectory>,
    pub bus: Arc<dyn EventBus>,
}

/// Everything the process runs: the HTTP state and the two listeners.
pub struct Core {
    pub state: AppState,
    pub saga: Arc<SagaListener>,
    pub compensation: Arc<CompensationListener>,
    bus: Arc<dyn EventBus>,
    poll_interval: std::time::Duration,
}

impl Core {
    pub fn new(config: &Config, backends: Backends) -> anyhow::Result<Self> {
        let capacity = NonZeroU32::new(config.rate_limit_capacity)
            .context("RATE_LIMIT_CAPACITY must be greater than zero")?;
        let refill = NonZeroU32::new(config.rate_limit_refill_per_sec)
            .context("RATE_LIMIT_REFILL_PER_SEC must be greater than zero")?;
        let admission = Arc::new(AdmissionController::new(capacity, refill));

        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
        let timeout = config.timeout_policy();
        let bus_policy = ResiliencePolicy::new(
            breakers.get_or_create(EVENT_BUS_BREAKER),
            config.retry_policy(),
            timeout,
        );
        let step_policy = ResiliencePolicy::new(
            breakers.get_or_create(SAGA_STEP_BREAKER),
            config.retry_policy(),
            timeout,
        );

        let publisher = EventPublisher::new(backends.bus.clone(), bus_policy);
        let processor = TransactionProcessor::new(backends.store.clone(), publisher, timeout);

        let listener_config = config.listener_config();
        let saga = Arc::new(SagaListener::new(
            processor.clone(),
            Arc::new(AmountLimitStep::new(config.saga_max_amount.clone())),
            step_policy,
            listener_config.clone(),
        ));
        let compensation = Arc::new(CompensationListener::new(
            processor.clone(),
            Arc::new(LoggingRefundHandler),
            listener_config.clone(),
        ));

        let health_checkers: Vec<Arc<dyn DependencyChecker>> = vec![
            Arc::new(StoreChecker::new(backends.store.clone())),
            Arc::new(BusChecker::new(backends.bus.clone())),
        ];

        let state = AppState {
            processor,
            owners: backends.owners,
            admission,
            breakers,
            health_checkers: Arc::new(health_checkers),
            store_timeout: timeout,
            started_at: Instant::now(),
        };

        Ok(Self {
            state,
            saga,
            compensation,
            bus: backends.bus,
            poll_interval: listener_config.poll_interval,
        })
    }

    /// Starts the saga and compensation listeners; they stop when `shutdown`
    /// is set to `true` or its sender is dropped.
    pub fn spawn_listeners(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_listener(
                self.saga.clone(),
                self.bus.clone(),
                self.poll_interval,
                shutdown.clone(),
            ),
            spawn_listener(
                self.compensation.clone(),
                self.bus.clone(),
                self.poll_interval,
                shutdown,
            ),
        ]
    }
}

/// Connects the configured backends: PostgreSQL when `DATABASE_URL` is set,
/// Redis when `REDIS_URL` is set, in-memory otherwise.
pub async fn connect_backends(config: &Config) -> anyhow::Result<Backends> {
    let (store, owners): (Arc<dyn TransactionStore>, Arc<dyn OwnerDirectory>) =
        match &config.database_url {
            Some(url) => {
                let pool = crate::db::create_pool(url)
                    .await
                    .context("Failed to connect to database")?;
                crate::db::run_migrations(&pool).await?;
                tracing::info!("Using PostgreSQL transaction store");
                let store: Arc<dyn TransactionStore> =
                    Arc::new(PostgresTransactionRepository::new(pool.clone()));
                let owners: Arc<dyn OwnerDirectory> = Arc::new(PostgresOwnerDirectory::new(pool));
                (store, owners)
            }
            None => {
                let owners = InMemoryOwnerDirectory::new();
                for id in &config.seed_owners {
                    owners.upsert(Owner::new(*id)).await;
                }
                tracing::warn!(
                    seeded_owners = config.seed_owners.len(),
                    "DATABASE_URL not set, using in-memory transaction store"
                );
                let store: Arc<dyn TransactionStore> = Arc::new(InMemoryTransactionStore::new());
                let owners: Arc<dyn OwnerDirectory> = Arc::new(owners);
                (store, owners)
            }
        };

    let bus: Arc<dyn EventBus> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Using Redis event bus");
            Arc::new(RedisEventBus::new(url).context("Invalid REDIS_URL")?)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process event bus");
            Arc::new(InMemoryEventBus::new())
        }
    };

    Ok(Backends { store, owners, bus })
}
