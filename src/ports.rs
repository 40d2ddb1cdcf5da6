//! Ports consumed by the processing core: transaction storage, owner
//! resolution and the event bus. Adapters live in `crate::adapters`.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Owner, Transaction, TransactionStatus};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Result of an insert under the `(owner, reference)` uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Transaction),
    /// A transaction with the same owner and reference already existed.
    Existing(Transaction),
}

/// Result of a compare-and-swap on a transaction's status.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSwap {
    Swapped(Transaction),
    /// The stored status did not match the expected one; carries the current record.
    Mismatch(Transaction),
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts `tx`, atomically enforcing uniqueness of `(owner_id, reference)`
    /// for non-empty references.
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<InsertOutcome>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>>;

    async fn find_by_owner_and_reference(
        &self,
        owner_id: Uuid,
        reference: &str,
    ) -> RepositoryResult<Option<Transaction>>;

    /// All transactions of `owner_id`, newest first.
    async fn find_by_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Transaction>>;

    /// Sets the status to `new` only if it currently equals `expected`.
    /// Returns `NotFound` when no transaction has this id.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        new: TransactionStatus,
    ) -> RepositoryResult<StatusSwap>;

    /// Records that `id` has been compensated. Returns `true` only for the
    /// call that set the mark; later calls return `false`.
    async fn mark_compensated(&self, id: Uuid) -> RepositoryResult<bool>;

    async fn ping(&self) -> RepositoryResult<()>;
}

#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn resolve(&self, owner_id: Uuid) -> RepositoryResult<Option<Owner>>;
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Event bus unavailable: {0}")]
    Unavailable(String),
}

/// Named channels of opaque string messages with at-least-once delivery.
///
/// Consumers `receive` a message, process it, then `ack` it. A message that is
/// never acknowledged may be delivered again.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError>;

    /// Waits at most `wait` for the next message on `channel`.
    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<String>, BusError>;

    async fn ack(&self, _channel: &str, _message: &str) -> Result<(), BusError> {
        Ok(())
    }

    /// Returns unacknowledged in-flight messages of `channel` to the queue.
    async fn recover(&self, _channel: &str) -> Result<usize, BusError> {
        Ok(0)
    }

    async fn ping(&self) -> Result<(), BusError>;
}
