//! Rollback side effects for failed sagas.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{CompensationEvent, Transaction, TransactionStatus, COMPENSATION_CHANNEL};
use crate::services::listener::{requeue_later, ListenerConfig, MessageHandler};
use crate::services::transaction_processor::TransactionProcessor;

#[derive(Debug, Clone, Error)]
#[error("compensation failed: {0}")]
pub struct CompensationError(pub String);

/// Performs the refund or rollback for one transaction.
///
/// Skipped once the store carries the transaction's compensation mark. A
/// process that dies after the refund but before the mark is written will
/// invoke the handler again on redelivery.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, tx: &Transaction, reason: &str) -> Result<(), CompensationError>;
}

/// Records the refund request in the log; the refund itself is executed by
/// the settlement side.
#[derive(Debug, Clone, Default)]
pub struct LoggingRefundHandler;

#[async_trait]
impl CompensationHandler for LoggingRefundHandler {
    async fn compensate(&self, tx: &Transaction, reason: &str) -> Result<(), CompensationError> {
        tracing::info!(
            transaction_id = %tx.id,
            owner_id = %tx.owner_id,
            amount = %tx.amount,
            status = %tx.status,
            reason,
            "Refund requested"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Compensated,
    /// Already compensated, or currently being compensated in this process.
    Duplicate,
    Requeued { attempt: u32 },
    DeadLettered,
}

pub struct CompensationListener {
    processor: TransactionProcessor,
    handler: Arc<dyn CompensationHandler>,
    config: ListenerConfig,
    /// Transactions being compensated right now. Entries are removed as soon
    /// as handling finishes; the durable record lives in the store.
    in_flight: Mutex<HashSet<Uuid>>,
}

enum Compensation {
    Done,
    AlreadyDone,
}

impl CompensationListener {
    pub fn new(
        processor: TransactionProcessor,
        handler: Arc<dyn CompensationHandler>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            processor,
            handler,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id)
    }

    fn release(&self, id: Uuid) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub async fn handle(&self, message: &str) -> CompensationOutcome {
        let event: CompensationEvent = match serde_json::from_str(message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = COMPENSATION_CHANNEL, error = %e, "Malformed compensation event");
                self.processor
                    .publisher()
                    .dead_letter(COMPENSATION_CHANNEL, message, &format!("malformed: {}", e))
                    .await;
                return CompensationOutcome::DeadLettered;
            }
        };

        let transaction_id = event.transaction_id;
        if !self.claim(transaction_id) {
            tracing::debug!(%transaction_id, "Compensation already in progress");
            return CompensationOutcome::Duplicate;
        }

        let result = self.compensate(&event).await;
        self.release(transaction_id);

        match result {
            Ok(Compensation::Done) => {
                tracing::info!(%transaction_id, reason = %event.reason, "Transaction compensated");
                CompensationOutcome::Compensated
            }
            Ok(Compensation::AlreadyDone) => {
                tracing::debug!(%transaction_id, "Duplicate compensation event ignored");
                CompensationOutcome::Duplicate
            }
            Err(reason) => self.retry_later(&event, &reason).await,
        }
    }

    async fn compensate(&self, event: &CompensationEvent) -> Result<Compensation, String> {
        let mut tx = self
            .processor
            .get_transaction(event.transaction_id)
            .await
            .map_err(|e| e.to_string())?;

        if tx.compensated_at.is_some() {
            return Ok(Compensation::AlreadyDone);
        }

        if tx.status == TransactionStatus::Pending {
            tx = self
                .processor
                .update_status(tx.id, TransactionStatus::Failed)
                .await
                .map_err(|e| e.to_string())?
                .transaction()
                .clone();
        }

        self.handler
            .compensate(&tx, &event.reason)
            .await
            .map_err(|e| e.to_string())?;

        // The refund has happened; a failed mark must not trigger a retry
        // that would run it again.
        match self.processor.mark_compensated(tx.id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                transaction_id = %tx.id,
                "Compensation mark already present; refund may have run twice"
            ),
            Err(e) => tracing::error!(
                transaction_id = %tx.id,
                error = %e,
                "Failed to record compensation; a redelivery will repeat the refund"
            ),
        }
        Ok(Compensation::Done)
    }

    async fn retry_later(&self, event: &CompensationEvent, reason: &str) -> CompensationOutcome {
        let publisher = self.processor.publisher();

        if event.attempt >= self.config.max_requeues {
            tracing::error!(
                transaction_id = %event.transaction_id,
                attempt = event.attempt,
                reason,
                "Compensation exhausted requeues; manual refund required"
            );
            match serde_json::to_string(event) {
                Ok(message) => publisher.dead_letter(COMPENSATION_CHANNEL, &message, reason).await,
                Err(e) => tracing::error!(error = %e, "Failed to encode compensation event"),
            }
            return CompensationOutcome::DeadLettered;
        }

        let next = event.requeued();
        tracing::warn!(
            transaction_id = %event.transaction_id,
            attempt = next.attempt,
            reason,
            "Compensation failed; requeueing"
        );
        requeue_later(publisher, COMPENSATION_CHANNEL, &next, self.config.requeue_delay);
        CompensationOutcome::Requeued {
            attempt: next.attempt,
        }
    }
}

#[async_trait]
impl MessageHandler for CompensationListener {
    fn channel(&self) -> &'static str {
        COMPENSATION_CHANNEL
    }

    async fn handle_message(&self, message: &str) {
        let outcome = self.handle(message).await;
        tracing::debug!(channel = COMPENSATION_CHANNEL, ?outcome, "Compensation event handled");
    }
}
