//! Transaction admission, persistence and the status state machine.

use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    NewTransaction, Owner, SagaEvent, Transaction, TransactionCreated, TransactionStatus,
    SAGA_CHANNEL, TRANSACTIONS_CHANNEL,
};
use crate::error::ProcessingError;
use crate::ports::{InsertOutcome, RepositoryError, StatusSwap, TransactionStore};
use crate::resilience::{PolicyError, TimeoutPolicy};
use crate::services::publisher::EventPublisher;
use crate::validation::{is_positive_amount, normalize_reference};

/// Result of `update_status`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied(Transaction),
    /// The transaction was already terminal (or lost a concurrent race);
    /// carries the record as stored.
    Unchanged(Transaction),
}

impl StatusUpdate {
    pub fn transaction(&self) -> &Transaction {
        match self {
            StatusUpdate::Applied(tx) | StatusUpdate::Unchanged(tx) => tx,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied(_))
    }
}

/// Owns the transaction state machine. All status mutation goes through
/// `create_transaction` and `update_status`.
#[derive(Clone)]
pub struct TransactionProcessor {
    store: Arc<dyn TransactionStore>,
    publisher: EventPublisher,
    store_timeout: TimeoutPolicy,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        publisher: EventPublisher,
        store_timeout: TimeoutPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            store_timeout,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T, PolicyError<RepositoryError>>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        self.store_timeout.call(fut).await
    }

    /// Validates and persists a new transaction, or returns the existing one
    /// for a repeated `(owner, reference)`. Publication of the lifecycle
    /// events happens in the background; this returns as soon as the record
    /// is stored.
    pub async fn create_transaction(
        &self,
        owner: &Owner,
        request: NewTransaction,
    ) -> Result<Transaction, ProcessingError> {
        if !owner.enabled {
            tracing::warn!(owner_id = %owner.id, "Rejected transaction for disabled owner");
            return Err(ProcessingError::InvalidOwnerState(owner.id));
        }
        if !is_positive_amount(&request.amount) {
            return Err(ProcessingError::InvalidAmount);
        }
        let reference = normalize_reference(request.reference.as_deref())?;

        if let Some(reference) = &reference {
            let existing = self
                .bounded(self.store.find_by_owner_and_reference(owner.id, reference))
                .await?;
            if let Some(existing) = existing {
                tracing::info!(
                    transaction_id = %existing.id,
                    owner_id = %owner.id,
                    reference = %reference,
                    "Duplicate request resolved to existing transaction"
                );
                return Ok(existing);
            }
        }

        let tx = Transaction::new(owner, request.amount, reference);
        let saved = match self.bounded(self.store.insert(&tx)).await? {
            InsertOutcome::Inserted(saved) => saved,
            InsertOutcome::Existing(existing) => {
                tracing::info!(
                    transaction_id = %existing.id,
                    owner_id = %owner.id,
                    "Concurrent duplicate resolved to existing transaction"
                );
                return Ok(existing);
            }
        };

        tracing::info!(
            transaction_id = %saved.id,
            owner_id = %saved.owner_id,
            amount = %saved.amount,
            "Transaction created"
        );
        self.publish_lifecycle(&saved);

        Ok(saved)
    }

    fn publish_lifecycle(&self, tx: &Transaction) {
        let created = TransactionCreated {
            transaction_id: tx.id,
            owner_id: tx.owner_id,
            amount: tx.amount.clone(),
            reference: tx.reference.clone(),
        };

        let encoded = [
            (TRANSACTIONS_CHANNEL, serde_json::to_string(&created)),
            (SAGA_CHANNEL, serde_json::to_string(&SagaEvent::start(tx.id))),
        ];

        let mut messages = Vec::with_capacity(encoded.len());
        for (channel, message) in encoded {
            match message {
                Ok(message) => messages.push((channel, message)),
                Err(e) => tracing::error!(
                    transaction_id = %tx.id,
                    channel,
                    error = %e,
                    "Failed to encode lifecycle event"
                ),
            }
        }

        self.publisher.publish_detached(tx.id, messages);
    }

    /// Moves a `PENDING` transaction to a terminal status. Terminal
    /// transactions are left untouched. Concurrent calls for the same id are
    /// serialized by a compare-and-swap in the store; exactly one wins.
    pub async fn update_status(
        &self,
        id: Uuid,
        new_status: TransactionStatus,
    ) -> Result<StatusUpdate, ProcessingError> {
        let current = self.get_transaction(id).await?;

        if current.is_terminal() {
            tracing::debug!(
                transaction_id = %id,
                status = %current.status,
                requested = %new_status,
                "Ignoring status update for terminal transaction"
            );
            return Ok(StatusUpdate::Unchanged(current));
        }

        if !current.status.can_transition_to(new_status) {
            return Err(ProcessingError::InvalidTransition {
                from: current.status,
                to: new_status,
            });
        }

        let swap = self
            .bounded(
                self.store
                    .compare_and_set_status(id, current.status, new_status),
            )
            .await;

        match swap {
            Ok(StatusSwap::Swapped(updated)) => {
                tracing::info!(
                    transaction_id = %id,
                    from = %current.status,
                    to = %updated.status,
                    "Transaction status updated"
                );
                Ok(StatusUpdate::Applied(updated))
            }
            Ok(StatusSwap::Mismatch(latest)) => {
                tracing::debug!(
                    transaction_id = %id,
                    status = %latest.status,
                    "Lost status race to a concurrent update"
                );
                Ok(StatusUpdate::Unchanged(latest))
            }
            Err(PolicyError::Inner(RepositoryError::NotFound(_))) => {
                Err(ProcessingError::NotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_transaction(&self, id: Uuid) -> Result<Option<Transaction>, ProcessingError> {
        Ok(self.bounded(self.store.find_by_id(id)).await?)
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Transaction, ProcessingError> {
        self.find_transaction(id)
            .await?
            .ok_or(ProcessingError::NotFound(id))
    }

    /// Durably records the rollback of `id`. `false` means it was already
    /// recorded.
    pub async fn mark_compensated(&self, id: Uuid) -> Result<bool, ProcessingError> {
        match self.bounded(self.store.mark_compensated(id)).await {
            Ok(marked) => Ok(marked),
            Err(PolicyError::Inner(RepositoryError::NotFound(_))) => {
                Err(ProcessingError::NotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches a transaction as seen by `owner`; transactions outside the
    /// owner's tenant scope are reported as not found.
    pub async fn get_for_owner(&self, owner: &Owner, id: Uuid) -> Result<Transaction, ProcessingError> {
        let tx = self.get_transaction(id).await?;
        if !tx.visible_to(owner) {
            return Err(ProcessingError::NotFound(id));
        }
        Ok(tx)
    }

    /// The owner's transactions, narrowed to its merchant or bank when it has one.
    pub async fn list_for_owner(&self, owner: &Owner) -> Result<Vec<Transaction>, ProcessingError> {
        let owned = self.bounded(self.store.find_by_owner(owner.id)).await?;
        Ok(owned.into_iter().filter(|tx| tx.visible_to(owner)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventBus, InMemoryTransactionStore};
    use crate::ports::EventBus;
    use crate::resilience::{BreakerConfig, CircuitBreaker, ResiliencePolicy, RetryPolicy};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryTransactionStore>,
        bus: Arc<InMemoryEventBus>,
        processor: TransactionProcessor,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryTransactionStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let policy = ResiliencePolicy::new(
            Arc::new(CircuitBreaker::new("event-bus", BreakerConfig::default())),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            TimeoutPolicy::new(Duration::from_secs(1)),
        );
        let publisher = EventPublisher::new(bus.clone(), policy);
        let processor =
            TransactionProcessor::new(store.clone(), publisher, TimeoutPolicy::default());
        Harness {
            store,
            bus,
            processor,
        }
    }

    fn request(amount: &str, reference: Option<&str>) -> NewTransaction {
        NewTransaction::new(
            BigDecimal::from_str(amount).unwrap(),
            reference.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn rejects_disabled_owner() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4()).disabled();

        let result = h.processor.create_transaction(&owner, request("10", None)).await;
        assert!(matches!(result, Err(ProcessingError::InvalidOwnerState(id)) if id == owner.id));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts_without_persisting() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        for amount in ["0", "-0.01", "-100", "0.000"] {
            let result = h
                .processor
                .create_transaction(&owner, request(amount, Some("REF")))
                .await;
            assert!(matches!(result, Err(ProcessingError::InvalidAmount)), "amount {}", amount);
        }
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn repeated_reference_returns_first_record() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let first = h
            .processor
            .create_transaction(&owner, request("25.00", Some("ORDER-7")))
            .await
            .unwrap();
        let second = h
            .processor
            .create_transaction(&owner, request("25.00", Some("ORDER-7")))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_persist_one_record() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let processor = h.processor.clone();
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                processor
                    .create_transaction(&owner, request("5", Some("RACE-1")))
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn create_publishes_created_and_saga_start() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let tx = h
            .processor
            .create_transaction(&owner, request("49.99", Some("TXN-100")))
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        let wait = Duration::from_secs(1);
        let created = h.bus.receive(TRANSACTIONS_CHANNEL, wait).await.unwrap().unwrap();
        let created: TransactionCreated = serde_json::from_str(&created).unwrap();
        assert_eq!(created.transaction_id, tx.id);

        let saga = h.bus.receive(SAGA_CHANNEL, wait).await.unwrap().unwrap();
        let saga: SagaEvent = serde_json::from_str(&saga).unwrap();
        assert_eq!(saga, SagaEvent::start(tx.id));
    }

    #[tokio::test]
    async fn settled_duplicate_returns_record_without_events() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let tx = h
            .processor
            .create_transaction(&owner, request("49.99", Some("TXN-100")))
            .await
            .unwrap();
        let wait = Duration::from_secs(1);
        h.bus.receive(TRANSACTIONS_CHANNEL, wait).await.unwrap().unwrap();
        h.bus.receive(SAGA_CHANNEL, wait).await.unwrap().unwrap();

        h.processor
            .update_status(tx.id, TransactionStatus::Success)
            .await
            .unwrap();

        let again = h
            .processor
            .create_transaction(&owner, request("49.99", Some("TXN-100")))
            .await
            .unwrap();
        assert_eq!(again.id, tx.id);
        assert_eq!(again.status, TransactionStatus::Success);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.bus.pending(TRANSACTIONS_CHANNEL), 0);
        assert_eq!(h.bus.pending(SAGA_CHANNEL), 0);
    }

    #[tokio::test]
    async fn control_chars_never_alias_another_reference() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let plain = h
            .processor
            .create_transaction(&owner, request("10", Some("TXN100")))
            .await
            .unwrap();

        for reference in ["TXN\t100", "TXN\u{0}100"] {
            let result = h
                .processor
                .create_transaction(&owner, request("99", Some(reference)))
                .await;
            match result {
                Err(ProcessingError::Validation(e)) => assert_eq!(e.field, "reference"),
                other => panic!("expected validation error for {:?}, got {:?}", reference, other),
            }
        }

        assert_eq!(h.store.len().await, 1);
        let stored = h.processor.get_transaction(plain.id).await.unwrap();
        assert_eq!(stored.amount, BigDecimal::from(10));
    }

    #[tokio::test]
    async fn blank_reference_is_not_an_idempotency_key() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());

        let a = h.processor.create_transaction(&owner, request("1", Some("  "))).await.unwrap();
        let b = h.processor.create_transaction(&owner, request("1", Some(""))).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.reference.is_none());
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());
        let tx = h.processor.create_transaction(&owner, request("3", None)).await.unwrap();

        let applied = h
            .processor
            .update_status(tx.id, TransactionStatus::Success)
            .await
            .unwrap();
        assert!(applied.is_applied());

        for next in [TransactionStatus::Failed, TransactionStatus::Success, TransactionStatus::Pending] {
            let update = h.processor.update_status(tx.id, next).await.unwrap();
            assert!(!update.is_applied());
            assert_eq!(update.transaction().status, TransactionStatus::Success);
        }
    }

    #[tokio::test]
    async fn pending_is_not_a_target_state() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());
        let tx = h.processor.create_transaction(&owner, request("3", None)).await.unwrap();

        let result = h.processor.update_status(tx.id, TransactionStatus::Pending).await;
        assert!(matches!(result, Err(ProcessingError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn concurrent_terminal_transitions_have_one_winner() {
        let h = harness();
        let owner = Owner::new(Uuid::new_v4());
        let tx = h.processor.create_transaction(&owner, request("3", None)).await.unwrap();

        let a = {
            let processor = h.processor.clone();
            tokio::spawn(async move { processor.update_status(tx.id, TransactionStatus::Success).await })
        };
        let b = {
            let processor = h.processor.clone();
            tokio::spawn(async move { processor.update_status(tx.id, TransactionStatus::Failed).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(
            [a.is_applied(), b.is_applied()].iter().filter(|x| **x).count(),
            1
        );
        let winner = if a.is_applied() { a.transaction() } else { b.transaction() };
        let stored = h.processor.get_transaction(tx.id).await.unwrap();
        assert_eq!(stored.status, winner.status);
        assert_eq!(a.transaction().status, b.transaction().status);
    }

    #[tokio::test]
    async fn update_of_unknown_transaction_is_not_found() {
        let h = harness();
        let result = h
            .processor
            .update_status(Uuid::new_v4(), TransactionStatus::Success)
            .await;
        assert!(matches!(result, Err(ProcessingError::NotFound(_))));
    }

    #[tokio::test]
    async fn listing_respects_tenant_scope() {
        let h = harness();
        let owner_id = Uuid::new_v4();
        let as_merchant = Owner::new(owner_id).with_merchant("M-1");
        let unscoped = Owner::new(owner_id);

        h.processor.create_transaction(&as_merchant, request("1", None)).await.unwrap();
        h.processor.create_transaction(&unscoped, request("2", None)).await.unwrap();

        assert_eq!(h.processor.list_for_owner(&as_merchant).await.unwrap().len(), 1);
        assert_eq!(h.processor.list_for_owner(&unscoped).await.unwrap().len(), 2);

        let stranger = Owner::new(Uuid::new_v4());
        assert!(h.processor.list_for_owner(&stranger).await.unwrap().is_empty());
    }
}
