//! Resilient, fire-and-forget publication of domain events.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::events::dead_letter_channel;
use crate::domain::DeadLetter;
use crate::ports::{BusError, EventBus};
use crate::resilience::{PolicyError, ResiliencePolicy};

#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    policy: ResiliencePolicy,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, policy: ResiliencePolicy) -> Self {
        Self { bus, policy }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Publishes one message under the bus resilience policy. Safe to retry
    /// because consumers treat redelivery as a no-op.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<(), PolicyError<BusError>> {
        let bus = &self.bus;
        self.policy.call(move || bus.publish(channel, message)).await
    }

    pub async fn publish_event<T: Serialize>(
        &self,
        channel: &str,
        event: &T,
    ) -> Result<(), PolicyError<BusError>> {
        let message = serde_json::to_string(event)
            .map_err(|e| PolicyError::Inner(BusError::Unavailable(format!("encode failed: {}", e))))?;
        self.publish(channel, &message).await
    }

    /// Publishes `messages` in order on a background task. The caller never
    /// waits for delivery; failures are logged for reconciliation and parked
    /// on the dead-letter channel when possible.
    pub fn publish_detached(
        &self,
        transaction_id: Uuid,
        messages: Vec<(&'static str, String)>,
    ) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            for (channel, message) in messages {
                match publisher.publish(channel, &message).await {
                    Ok(()) => {
                        tracing::debug!(%transaction_id, channel, "Event published");
                    }
                    Err(e) => {
                        tracing::error!(
                            %transaction_id,
                            channel,
                            error = %e,
                            "Event delivery failed; transaction requires reconciliation"
                        );
                        publisher.dead_letter(channel, &message, &e.to_string()).await;
                    }
                }
            }
        })
    }

    /// Best-effort park of an unprocessable or undeliverable message. Bypasses
    /// the breaker so dead letters still flow while it is open.
    pub async fn dead_letter(&self, channel: &str, message: &str, error: &str) {
        let letter = DeadLetter {
            channel: channel.to_string(),
            message: message.to_string(),
            error: error.to_string(),
        };
        let encoded = match serde_json::to_string(&letter) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(channel, error = %e, "Failed to encode dead letter");
                return;
            }
        };

        let dlq = dead_letter_channel(channel);
        let result = self
            .policy
            .timeout()
            .call(self.bus.publish(&dlq, &encoded))
            .await;
        match result {
            Ok(()) => tracing::warn!(channel, reason = error, "Message dead-lettered"),
            Err(e) => tracing::error!(
                channel,
                message,
                error = %e,
                "Failed to dead-letter message; manual reconciliation required"
            ),
        }
    }
}
