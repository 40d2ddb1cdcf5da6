//! Drives transactions from `PENDING` to a terminal state off the saga channel.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{
    CompensationEvent, SagaEvent, SagaEventKind, Transaction, TransactionStatus,
    COMPENSATION_CHANNEL, SAGA_CHANNEL,
};
use crate::error::ProcessingError;
use crate::resilience::{PolicyError, ResiliencePolicy};
use crate::services::listener::{requeue_later, ListenerConfig, MessageHandler};
use crate::services::transaction_processor::{StatusUpdate, TransactionProcessor};

/// Verdict of a saga step on a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Approved,
    Declined(String),
}

/// The step could not reach a verdict.
#[derive(Debug, Clone, Error)]
#[error("saga step failed: {0}")]
pub struct StepError(pub String);

/// External validation or processing run for `START` and `STEP` events.
/// Must be idempotent; it runs under retry.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, tx: &Transaction, event: &SagaEvent) -> Result<StepOutcome, StepError>;
}

/// Approves every transaction up to an optional amount ceiling.
#[derive(Debug, Clone, Default)]
pub struct AmountLimitStep {
    max_amount: Option<BigDecimal>,
}

impl AmountLimitStep {
    pub fn new(max_amount: Option<BigDecimal>) -> Self {
        Self { max_amount }
    }
}

#[async_trait]
impl SagaStep for AmountLimitStep {
    fn name(&self) -> &'static str {
        "amount-limit"
    }

    async fn execute(&self, tx: &Transaction, _event: &SagaEvent) -> Result<StepOutcome, StepError> {
        match &self.max_amount {
            Some(max) if tx.amount > *max => Ok(StepOutcome::Declined(format!(
                "amount {} exceeds limit {}",
                tx.amount, max
            ))),
            _ => Ok(StepOutcome::Approved),
        }
    }
}

/// What the listener did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    Completed,
    /// The transaction is `FAILED` and compensation was requested.
    Failed,
    /// Redelivery for a transaction that is already terminal.
    Skipped,
    Requeued { attempt: u32 },
    DeadLettered,
}

pub struct SagaListener {
    processor: TransactionProcessor,
    step: Arc<dyn SagaStep>,
    step_policy: ResiliencePolicy,
    config: ListenerConfig,
}

impl SagaListener {
    pub fn new(
        processor: TransactionProcessor,
        step: Arc<dyn SagaStep>,
        step_policy: ResiliencePolicy,
        config: ListenerConfig,
    ) -> Self {
        Self {
            processor,
            step,
            step_policy,
            config,
        }
    }

    pub async fn handle(&self, message: &str) -> SagaOutcome {
        let event: SagaEvent = match serde_json::from_str(message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = SAGA_CHANNEL, error = %e, "Malformed saga event");
                self.processor
                    .publisher()
                    .dead_letter(SAGA_CHANNEL, message, &format!("malformed: {}", e))
                    .await;
                return SagaOutcome::DeadLettered;
            }
        };

        let transaction_id = event.transaction_id;
        let tx = match self.processor.find_transaction(transaction_id).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return self.requeue(&event, "transaction not found").await,
            Err(e) => return self.requeue(&event, &e.to_string()).await,
        };

        if tx.status == TransactionStatus::Failed && event.kind != SagaEventKind::Complete {
            // The consumer may have died between the FAILED swap and the
            // compensation publish; compensation consumers are idempotent.
            tracing::info!(
                %transaction_id,
                kind = ?event.kind,
                "Saga event redelivered for failed transaction; re-requesting compensation"
            );
            self.request_compensation(&event, "saga failure redelivered")
                .await;
            return SagaOutcome::Failed;
        }

        if tx.is_terminal() {
            tracing::debug!(
                %transaction_id,
                status = %tx.status,
                kind = ?event.kind,
                "Saga event for terminal transaction ignored"
            );
            return SagaOutcome::Skipped;
        }

        match event.kind {
            SagaEventKind::Start | SagaEventKind::Step => self.run_step(&tx, &event).await,
            SagaEventKind::Complete => self.complete(&event).await,
            SagaEventKind::Fail => self.fail(&event, "saga failed upstream").await,
        }
    }

    async fn run_step(&self, tx: &Transaction, event: &SagaEvent) -> SagaOutcome {
        let step = &self.step;
        let result = self.step_policy.call(|| step.execute(tx, event)).await;

        match result {
            Ok(StepOutcome::Approved) => self.complete(event).await,
            Ok(StepOutcome::Declined(reason)) => {
                tracing::info!(
                    transaction_id = %tx.id,
                    step = step.name(),
                    reason = %reason,
                    "Saga step declined transaction"
                );
                self.fail(event, &reason).await
            }
            Err(PolicyError::Inner(e)) => {
                tracing::warn!(
                    transaction_id = %tx.id,
                    step = step.name(),
                    error = %e,
                    "Saga step failed"
                );
                self.fail(event, &e.to_string()).await
            }
            Err(e) => self.requeue(event, &e.to_string()).await,
        }
    }

    async fn complete(&self, event: &SagaEvent) -> SagaOutcome {
        match self
            .processor
            .update_status(event.transaction_id, TransactionStatus::Success)
            .await
        {
            Ok(StatusUpdate::Applied(_)) => SagaOutcome::Completed,
            Ok(StatusUpdate::Unchanged(_)) => SagaOutcome::Skipped,
            Err(e) => self.on_update_error(event, e).await,
        }
    }

    async fn fail(&self, event: &SagaEvent, reason: &str) -> SagaOutcome {
        match self
            .processor
            .update_status(event.transaction_id, TransactionStatus::Failed)
            .await
        {
            Ok(StatusUpdate::Applied(_)) => {
                self.request_compensation(event, reason).await;
                SagaOutcome::Failed
            }
            Ok(StatusUpdate::Unchanged(current)) if current.status == TransactionStatus::Failed => {
                self.request_compensation(event, reason).await;
                SagaOutcome::Failed
            }
            Ok(StatusUpdate::Unchanged(_)) => SagaOutcome::Skipped,
            Err(e) => self.on_update_error(event, e).await,
        }
    }

    async fn on_update_error(&self, event: &SagaEvent, e: ProcessingError) -> SagaOutcome {
        if e.is_transient() {
            return self.requeue(event, &e.to_string()).await;
        }
        tracing::error!(transaction_id = %event.transaction_id, error = %e, "Saga status update rejected");
        self.dead_letter(event, &e.to_string()).await;
        SagaOutcome::DeadLettered
    }

    async fn request_compensation(&self, event: &SagaEvent, reason: &str) {
        let compensation = CompensationEvent::new(event.transaction_id, reason);
        let publisher = self.processor.publisher();
        if let Err(e) = publisher
            .publish_event(COMPENSATION_CHANNEL, &compensation)
            .await
        {
            tracing::error!(
                transaction_id = %event.transaction_id,
                error = %e,
                "Failed to request compensation; transaction requires reconciliation"
            );
            if let Ok(message) = serde_json::to_string(&compensation) {
                publisher
                    .dead_letter(COMPENSATION_CHANNEL, &message, &e.to_string())
                    .await;
            }
        }
    }

    async fn requeue(&self, event: &SagaEvent, reason: &str) -> SagaOutcome {
        if event.attempt >= self.config.max_requeues {
            tracing::error!(
                transaction_id = %event.transaction_id,
                attempt = event.attempt,
                reason,
                "Saga event exhausted requeues"
            );
            self.dead_letter(event, reason).await;
            return SagaOutcome::DeadLettered;
        }

        let next = event.requeued();
        tracing::debug!(
            transaction_id = %event.transaction_id,
            attempt = next.attempt,
            reason,
            "Requeueing saga event"
        );
        requeue_later(
            self.processor.publisher(),
            SAGA_CHANNEL,
            &next,
            self.config.requeue_delay,
        );
        SagaOutcome::Requeued {
            attempt: next.attempt,
        }
    }

    async fn dead_letter(&self, event: &SagaEvent, reason: &str) {
        match serde_json::to_string(event) {
            Ok(message) => {
                self.processor
                    .publisher()
                    .dead_letter(SAGA_CHANNEL, &message, reason)
                    .await
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode saga event"),
        }
    }
}

#[async_trait]
impl MessageHandler for SagaListener {
    fn channel(&self) -> &'static str {
        SAGA_CHANNEL
    }

    async fn handle_message(&self, message: &str) {
        let outcome = self.handle(message).await;
        tracing::debug!(channel = SAGA_CHANNEL, ?outcome, "Saga event handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventBus, InMemoryTransactionStore};
    use crate::ports::EventBus;
    use crate::domain::events::dead_letter_channel;
    use crate::domain::{NewTransaction, Owner};
    use crate::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy, TimeoutPolicy};
    use crate::services::publisher::EventPublisher;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn policy(name: &str) -> ResiliencePolicy {
        ResiliencePolicy::new(
            Arc::new(CircuitBreaker::new(name, BreakerConfig::default())),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            TimeoutPolicy::new(Duration::from_millis(100)),
        )
    }

    struct Harness {
        bus: Arc<InMemoryEventBus>,
        processor: TransactionProcessor,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Arc::new(InMemoryEventBus::new());
            let publisher = EventPublisher::new(bus.clone(), policy("event-bus"));
            let processor = TransactionProcessor::new(
                Arc::new(InMemoryTransactionStore::new()),
                publisher,
                TimeoutPolicy::default(),
            );
            Self { bus, processor }
        }

        fn listener(&self, step: Arc<dyn SagaStep>, max_requeues: u32) -> SagaListener {
            SagaListener::new(
                self.processor.clone(),
                step,
                policy("saga-step"),
                ListenerConfig {
                    poll_interval: Duration::from_millis(20),
                    max_requeues,
                    requeue_delay: Duration::from_millis(1),
                },
            )
        }

        async fn pending(&self, amount: &str) -> Transaction {
            let owner = Owner::new(Uuid::new_v4());
            let request = NewTransaction::new(BigDecimal::from_str(amount).unwrap(), None);
            self.processor.create_transaction(&owner, request).await.unwrap()
        }

        async fn status(&self, id: Uuid) -> TransactionStatus {
            self.processor.get_transaction(id).await.unwrap().status
        }
    }

    fn encode(event: &SagaEvent) -> String {
        serde_json::to_string(event).unwrap()
    }

    struct FlakyStep {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SagaStep for FlakyStep {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn execute(&self, _tx: &Transaction, _event: &SagaEvent) -> Result<StepOutcome, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError("gateway unreachable".to_string()))
        }
    }

    struct HangingStep;

    #[async_trait]
    impl SagaStep for HangingStep {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn execute(&self, _tx: &Transaction, _event: &SagaEvent) -> Result<StepOutcome, StepError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepOutcome::Approved)
        }
    }

    #[tokio::test]
    async fn start_with_approving_step_completes() {
        let h = Harness::new();
        let tx = h.pending("49.99").await;
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 3);

        let outcome = listener.handle(&encode(&SagaEvent::start(tx.id))).await;
        assert_eq!(outcome, SagaOutcome::Completed);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn declined_step_fails_and_requests_compensation() {
        let h = Harness::new();
        let tx = h.pending("500").await;
        let step = AmountLimitStep::new(Some(BigDecimal::from(100)));
        let listener = h.listener(Arc::new(step), 3);

        let outcome = listener.handle(&encode(&SagaEvent::start(tx.id))).await;
        assert_eq!(outcome, SagaOutcome::Failed);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Failed);

        let compensations = h.bus.drain(COMPENSATION_CHANNEL);
        assert_eq!(compensations.len(), 1);
        let event: CompensationEvent = serde_json::from_str(&compensations[0]).unwrap();
        assert_eq!(event.transaction_id, tx.id);
    }

    #[tokio::test]
    async fn erroring_step_is_retried_then_fails() {
        let h = Harness::new();
        let tx = h.pending("10").await;
        let step = Arc::new(FlakyStep {
            calls: AtomicU32::new(0),
        });
        let listener = h.listener(step.clone(), 3);

        let outcome = listener.handle(&encode(&SagaEvent::start(tx.id))).await;
        assert_eq!(outcome, SagaOutcome::Failed);
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.bus.pending(COMPENSATION_CHANNEL), 1);
    }

    #[tokio::test]
    async fn timed_out_step_is_requeued_not_failed() {
        let h = Harness::new();
        let tx = h.pending("10").await;
        let listener = h.listener(Arc::new(HangingStep), 3);

        let outcome = listener.handle(&encode(&SagaEvent::start(tx.id))).await;
        assert_eq!(outcome, SagaOutcome::Requeued { attempt: 1 });
        assert_eq!(h.status(tx.id).await, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn complete_and_fail_events_drive_status() {
        let h = Harness::new();
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 3);

        let a = h.pending("1").await;
        let complete = SagaEvent::new(a.id, SagaEventKind::Complete);
        assert_eq!(listener.handle(&encode(&complete)).await, SagaOutcome::Completed);
        assert_eq!(h.status(a.id).await, TransactionStatus::Success);

        let b = h.pending("1").await;
        let fail = SagaEvent::new(b.id, SagaEventKind::Fail);
        assert_eq!(listener.handle(&encode(&fail)).await, SagaOutcome::Failed);
        assert_eq!(h.status(b.id).await, TransactionStatus::Failed);
        assert_eq!(h.bus.pending(COMPENSATION_CHANNEL), 1);
    }

    #[tokio::test]
    async fn redelivery_to_terminal_transaction_is_a_no_op() {
        let h = Harness::new();
        let tx = h.pending("1").await;
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 3);
        let start = encode(&SagaEvent::start(tx.id));

        assert_eq!(listener.handle(&start).await, SagaOutcome::Completed);
        assert_eq!(listener.handle(&start).await, SagaOutcome::Skipped);

        let fail = SagaEvent::new(tx.id, SagaEventKind::Fail);
        assert_eq!(listener.handle(&encode(&fail)).await, SagaOutcome::Skipped);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Success);
        assert_eq!(h.bus.pending(COMPENSATION_CHANNEL), 0);
    }

    #[tokio::test]
    async fn redelivered_failure_re_requests_compensation() {
        let h = Harness::new();
        let tx = h.pending("1").await;
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 3);

        // FAILED is stored but the compensation request never went out.
        h.processor
            .update_status(tx.id, TransactionStatus::Failed)
            .await
            .unwrap();
        assert_eq!(h.bus.pending(COMPENSATION_CHANNEL), 0);

        let fail = SagaEvent::new(tx.id, SagaEventKind::Fail);
        assert_eq!(listener.handle(&encode(&fail)).await, SagaOutcome::Failed);

        let compensations = h.bus.drain(COMPENSATION_CHANNEL);
        assert_eq!(compensations.len(), 1);
        let event: CompensationEvent = serde_json::from_str(&compensations[0]).unwrap();
        assert_eq!(event.transaction_id, tx.id);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn redelivered_declined_start_re_requests_compensation() {
        let h = Harness::new();
        let tx = h.pending("500").await;
        let step = AmountLimitStep::new(Some(BigDecimal::from(100)));
        let listener = h.listener(Arc::new(step), 3);
        let start = encode(&SagaEvent::start(tx.id));

        assert_eq!(listener.handle(&start).await, SagaOutcome::Failed);
        assert_eq!(listener.handle(&start).await, SagaOutcome::Failed);
        assert_eq!(h.bus.pending(COMPENSATION_CHANNEL), 2);
    }

    #[tokio::test]
    async fn unknown_transaction_is_requeued_then_dead_lettered() {
        let h = Harness::new();
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 2);
        let id = Uuid::new_v4();

        let first = SagaEvent::start(id);
        assert_eq!(
            listener.handle(&encode(&first)).await,
            SagaOutcome::Requeued { attempt: 1 }
        );

        let requeued = h
            .bus
            .receive(SAGA_CHANNEL, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("requeued event");
        let requeued: SagaEvent = serde_json::from_str(&requeued).unwrap();
        assert_eq!(requeued.attempt, 1);

        let exhausted = SagaEvent {
            attempt: 2,
            ..SagaEvent::start(id)
        };
        assert_eq!(listener.handle(&encode(&exhausted)).await, SagaOutcome::DeadLettered);
        assert_eq!(h.bus.pending(&dead_letter_channel(SAGA_CHANNEL)), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered() {
        let h = Harness::new();
        let listener = h.listener(Arc::new(AmountLimitStep::default()), 3);

        assert_eq!(listener.handle("{not json").await, SagaOutcome::DeadLettered);
        assert_eq!(listener.handle(r#"{"kind":"START"}"#).await, SagaOutcome::DeadLettered);
        assert_eq!(h.bus.pending(&dead_letter_channel(SAGA_CHANNEL)), 2);
    }
}
