//! Shared consumer loop for bus-driven listeners.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ports::EventBus;
use crate::services::publisher::EventPublisher;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Upper bound on a single blocking receive; also the shutdown latency.
    pub poll_interval: Duration,
    pub max_requeues: u32,
    pub requeue_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_requeues: 5,
            requeue_delay: Duration::from_millis(500),
        }
    }
}

/// A consumer of one bus channel.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn channel(&self) -> &'static str;

    /// Handles one raw message. Failures are dealt with inside (requeue or
    /// dead letter); the loop acknowledges the message afterwards regardless.
    async fn handle_message(&self, message: &str);
}

/// Runs `handler` against its channel until `shutdown` flips. Messages left
/// in flight by a previous crash are recovered before the first receive.
pub fn spawn_listener<H>(
    handler: Arc<H>,
    bus: Arc<dyn EventBus>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    H: MessageHandler,
{
    tokio::spawn(async move {
        let channel = handler.channel();

        match bus.recover(channel).await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(channel, recovered, "Recovered in-flight messages"),
            Err(e) => tracing::warn!(channel, error = %e, "Failed to recover in-flight messages"),
        }

        tracing::info!(channel, "Listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                received = bus.receive(channel, poll_interval) => match received {
                    Ok(Some(message)) => {
                        handler.handle_message(&message).await;
                        if let Err(e) = bus.ack(channel, &message).await {
                            tracing::warn!(channel, error = %e, "Failed to acknowledge message");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(channel, error = %e, "Receive failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }

        tracing::info!(channel, "Listener stopped");
    })
}

/// Re-publishes `event` on `channel` after `delay` without blocking the
/// caller. The retry goes through the publisher's resilience policy and falls
/// back to the dead-letter channel.
pub(crate) fn requeue_later<T>(
    publisher: &EventPublisher,
    channel: &'static str,
    event: &T,
    delay: Duration,
) where
    T: Serialize,
{
    let message = match serde_json::to_string(event) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(channel, error = %e, "Failed to encode requeued event");
            return;
        }
    };

    let publisher = publisher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = publisher.publish(channel, &message).await {
            tracing::error!(channel, error = %e, "Requeue failed");
            publisher.dead_letter(channel, &message, &e.to_string()).await;
        }
    });
}
