//! Messages carried on the event channels.
//!
//! Every message is JSON text and always carries the transaction id.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRANSACTIONS_CHANNEL: &str = "transactions";
pub const SAGA_CHANNEL: &str = "saga-events";
pub const COMPENSATION_CHANNEL: &str = "compensation-events";

const DEAD_LETTER_SUFFIX: &str = ".dlq";

pub fn dead_letter_channel(channel: &str) -> String {
    format!("{}{}", channel, DEAD_LETTER_SUFFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionCreated {
    pub transaction_id: Uuid,
    pub owner_id: Uuid,
    pub amount: BigDecimal,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SagaEventKind {
    Start,
    Step,
    Complete,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaEvent {
    pub transaction_id: Uuid,
    pub kind: SagaEventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Number of times this event was requeued because the transaction was
    /// not yet visible.
    #[serde(default)]
    pub attempt: u32,
}

impl SagaEvent {
    pub fn new(transaction_id: Uuid, kind: SagaEventKind) -> Self {
        Self {
            transaction_id,
            kind,
            payload: serde_json::Value::Null,
            attempt: 0,
        }
    }

    pub fn start(transaction_id: Uuid) -> Self {
        Self::new(transaction_id, SagaEventKind::Start)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompensationEvent {
    pub transaction_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub attempt: u32,
}

impl CompensationEvent {
    pub fn new(transaction_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            transaction_id,
            reason: reason.into(),
            attempt: 0,
        }
    }

    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// A message that could not be processed, parked for out-of-band inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub channel: String,
    pub message: String,
    pub error: String,
}
