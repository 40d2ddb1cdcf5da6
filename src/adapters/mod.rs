//! Adapters implementing the ports in `crate::ports`.

pub mod memory;
pub mod postgres_transaction_repository;
pub mod redis_event_bus;

pub use memory::{InMemoryEventBus, InMemoryOwnerDirectory, InMemoryTransactionStore};
pub use postgres_transaction_repository::{PostgresOwnerDirectory, PostgresTransactionRepository};
pub use redis_event_bus::RedisEventBus;
