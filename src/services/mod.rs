pub mod admission;
pub mod compensation_listener;
pub mod listener;
pub mod publisher;
pub mod saga_listener;
pub mod transaction_processor;

pub use admission::AdmissionController;
pub use compensation_listener::{
    CompensationHandler, CompensationListener, CompensationOutcome, LoggingRefundHandler,
};
pub use listener::{spawn_listener, ListenerConfig, MessageHandler};
pub use publisher::EventPublisher;
pub use saga_listener::{AmountLimitStep, SagaListener, SagaOutcome, SagaStep, StepError, StepOutcome};
pub use transaction_processor::{StatusUpdate, TransactionProcessor};
