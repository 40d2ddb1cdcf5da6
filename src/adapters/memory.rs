//! In-memory adapters for tests and single-process runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::domain::{Owner, Transaction, TransactionStatus};
use crate::ports::{
    BusError, EventBus, InsertOutcome, OwnerDirectory, RepositoryError, RepositoryResult,
    StatusSwap, TransactionStore,
};

#[derive(Default)]
struct StoreInner {
    transactions: HashMap<Uuid, Transaction>,
    by_reference: HashMap<(Uuid, String), Uuid>,
}

/// A thread-safe in-memory transaction store.
///
/// The reference index and the records share one lock, so the uniqueness
/// check and the insert happen atomically.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.transactions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn reference_key(tx: &Transaction) -> Option<(Uuid, String)> {
    tx.reference
        .as_ref()
        .filter(|r| !r.is_empty())
        .map(|r| (tx.owner_id, r.clone()))
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<InsertOutcome> {
        let mut inner = self.inner.write().await;

        let key = reference_key(tx);
        if let Some(key) = &key {
            if let Some(existing) = inner
                .by_reference
                .get(key)
                .and_then(|id| inner.transactions.get(id))
            {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
        }

        if let Some(key) = key {
            inner.by_reference.insert(key, tx.id);
        }
        inner.transactions.insert(tx.id, tx.clone());
        Ok(InsertOutcome::Inserted(tx.clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner.transactions.get(&id).cloned())
    }

    async fn find_by_owner_and_reference(
        &self,
        owner_id: Uuid,
        reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_reference
            .get(&(owner_id, reference.to_string()))
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut owned: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        new: TransactionStatus,
    ) -> RepositoryResult<StatusSwap> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .transactions
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        if tx.status != expected {
            return Ok(StatusSwap::Mismatch(tx.clone()));
        }

        tx.status = new;
        tx.updated_at = chrono::Utc::now();
        Ok(StatusSwap::Swapped(tx.clone()))
    }

    async fn mark_compensated(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .transactions
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        if tx.compensated_at.is_some() {
            return Ok(false);
        }

        let now = chrono::Utc::now();
        tx.compensated_at = Some(now);
        tx.updated_at = now;
        Ok(true)
    }

    async fn ping(&self) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Owner directory backed by a map, seeded up front.
#[derive(Default, Clone)]
pub struct InMemoryOwnerDirectory {
    owners: Arc<RwLock<HashMap<Uuid, Owner>>>,
}

impl InMemoryOwnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, owner: Owner) {
        self.owners.write().await.insert(owner.id, owner);
    }
}

#[async_trait]
impl OwnerDirectory for InMemoryOwnerDirectory {
    async fn resolve(&self, owner_id: Uuid) -> RepositoryResult<Option<Owner>> {
        Ok(self.owners.read().await.get(&owner_id).cloned())
    }
}

/// Process-local event bus. Each channel is a FIFO queue; a message is handed
/// to exactly one receiver.
#[derive(Default, Clone)]
pub struct InMemoryEventBus {
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    notify: Arc<Notify>,
    failing_publishes: Arc<AtomicU32>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail, simulating a broker outage.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    pub fn pending(&self, channel: &str) -> usize {
        self.lock_queues().get(channel).map_or(0, VecDeque::len)
    }

    /// Removes and returns every queued message of `channel`.
    pub fn drain(&self, channel: &str) -> Vec<String> {
        self.lock_queues()
            .get_mut(channel)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        // A poisoned lock only means another thread panicked mid-push; the
        // queues themselves are still consistent.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self, channel: &str) -> Option<String> {
        self.lock_queues().get_mut(channel).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let injected_failure = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(BusError::Unavailable("injected publish failure".to_string()));
        }

        self.lock_queues()
            .entry(channel.to_string())
            .or_default()
            .push_back(message.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<String>, BusError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.pop(channel) {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop(channel));
            }
        }
    }

    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    fn sample(owner: &Owner, reference: Option<&str>) -> Transaction {
        Transaction::new(owner, BigDecimal::from(10), reference.map(str::to_string))
    }

    #[tokio::test]
    async fn insert_enforces_owner_reference_uniqueness() {
        let store = InMemoryTransactionStore::new();
        let owner = Owner::new(Uuid::new_v4());

        let first = sample(&owner, Some("REF-1"));
        let second = sample(&owner, Some("REF-1"));

        assert!(matches!(
            store.insert(&first).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        match store.insert(&second).await.unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn compensation_mark_is_set_once() {
        let store = InMemoryTransactionStore::new();
        let tx = sample(&Owner::new(Uuid::new_v4()), None);
        store.insert(&tx).await.unwrap();

        assert!(store.mark_compensated(tx.id).await.unwrap());
        assert!(!store.mark_compensated(tx.id).await.unwrap());
        let stored = store.find_by_id(tx.id).await.unwrap().unwrap();
        assert!(stored.compensated_at.is_some());

        assert!(matches!(
            store.mark_compensated(Uuid::new_v4()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn same_reference_for_different_owners_is_allowed() {
        let store = InMemoryTransactionStore::new();
        let a = Owner::new(Uuid::new_v4());
        let b = Owner::new(Uuid::new_v4());

        store.insert(&sample(&a, Some("REF-1"))).await.unwrap();
        store.insert(&sample(&b, Some("REF-1"))).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn empty_reference_is_not_indexed() {
        let store = InMemoryTransactionStore::new();
        let owner = Owner::new(Uuid::new_v4());

        store.insert(&sample(&owner, Some(""))).await.unwrap();
        store.insert(&sample(&owner, Some(""))).await.unwrap();
        store.insert(&sample(&owner, None)).await.unwrap();
        assert_eq!(store.find_by_owner(owner.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn compare_and_set_only_swaps_expected_status() {
        let store = InMemoryTransactionStore::new();
        let owner = Owner::new(Uuid::new_v4());
        let tx = sample(&owner, None);
        store.insert(&tx).await.unwrap();

        let swapped = store
            .compare_and_set_status(tx.id, TransactionStatus::Pending, TransactionStatus::Success)
            .await
            .unwrap();
        assert!(matches!(swapped, StatusSwap::Swapped(ref t) if t.status == TransactionStatus::Success));

        let second = store
            .compare_and_set_status(tx.id, TransactionStatus::Pending, TransactionStatus::Failed)
            .await
            .unwrap();
        assert!(matches!(second, StatusSwap::Mismatch(ref t) if t.status == TransactionStatus::Success));

        let missing = store
            .compare_and_set_status(Uuid::new_v4(), TransactionStatus::Pending, TransactionStatus::Failed)
            .await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn bus_delivers_in_order_per_channel() {
        let bus = InMemoryEventBus::new();
        bus.publish("a", "1").await.unwrap();
        bus.publish("a", "2").await.unwrap();
        bus.publish("b", "x").await.unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(bus.receive("a", wait).await.unwrap().as_deref(), Some("1"));
        assert_eq!(bus.receive("a", wait).await.unwrap().as_deref(), Some("2"));
        assert_eq!(bus.receive("a", wait).await.unwrap(), None);
        assert_eq!(bus.pending("b"), 1);
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let bus = InMemoryEventBus::new();
        let consumer = bus.clone();
        let handle =
            tokio::spawn(async move { consumer.receive("c", Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("c", "hello").await.unwrap();

        let received = handle.await.unwrap().unwrap();
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(2);
        assert!(bus.publish("a", "1").await.is_err());
        assert!(bus.publish("a", "1").await.is_err());
        assert!(bus.publish("a", "1").await.is_ok());
        assert_eq!(bus.pending("a"), 1);
    }
}
