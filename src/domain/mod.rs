//! Domain layer: core business entities and the messages exchanged between
//! the processor and its listeners.

pub mod events;
pub mod transaction;

pub use events::{
    CompensationEvent, DeadLetter, SagaEvent, SagaEventKind, TransactionCreated,
    COMPENSATION_CHANNEL, SAGA_CHANNEL, TRANSACTIONS_CHANNEL,
};
pub use transaction::{NewTransaction, Owner, Transaction, TransactionStatus};
