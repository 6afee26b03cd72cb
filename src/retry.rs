// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-Letter Coordination
//!
//! Decides what happens to a delivery whose handler failed and performs the
//! dead-letter publish. A retryable failure is requeued while the retry budget
//! lasts, with a delay of `min(max, base * 2^retry_count)`. A non-retryable
//! failure or an exhausted budget dead-letters the message; a discard request
//! drops it.
//!
//! Dead-letter copies go through the [`Publisher`] with its retry policy. When
//! even that fails the loss is logged at error level and counted in
//! `dead_letter_failures`.

use crate::{
    config::{DeadLetterConfig, RetryConfig},
    errors::{HandlerError, HandlerErrorKind, PublishError},
    message::{DeadLetterRecord, InboundMessage},
    publisher::Publisher,
    transport::{MessageProperties, WireMessage},
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{error, warn};

/// Exchange and routing key dead-lettered copies are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterDestination {
    pub exchange: String,
    pub routing_key: String,
}

impl DeadLetterDestination {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        DeadLetterDestination {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    /// A queue addressed through the default exchange.
    pub fn queue(name: &str) -> Self {
        DeadLetterDestination::new("", name)
    }

    pub fn from_config(cfg: &DeadLetterConfig) -> Self {
        DeadLetterDestination::new(&cfg.exchange, &cfg.routing_key)
    }
}

/// Dead-letter destinations by source queue, with a process-wide fallback.
#[derive(Debug)]
pub struct DeadLetterRoutes {
    fallback: DeadLetterDestination,
    per_queue: RwLock<HashMap<String, DeadLetterDestination>>,
}

impl Default for DeadLetterRoutes {
    fn default() -> Self {
        DeadLetterRoutes::new(DeadLetterDestination::from_config(
            &DeadLetterConfig::default(),
        ))
    }
}

impl DeadLetterRoutes {
    pub fn new(fallback: DeadLetterDestination) -> Self {
        DeadLetterRoutes {
            fallback,
            per_queue: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, queue: &str, destination: DeadLetterDestination) {
        if let Ok(mut routes) = self.per_queue.write() {
            routes.insert(queue.to_owned(), destination);
        }
    }

    pub fn resolve(&self, queue: &str) -> DeadLetterDestination {
        self.per_queue
            .read()
            .ok()
            .and_then(|routes| routes.get(queue).cloned())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            base_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
        }
    }

    /// Delay before the redelivery that follows `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&RetryConfig::default())
    }
}

/// Outcome of a handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Redeliver after `delay` with the retry count incremented
    Requeue { delay: Duration },
    DeadLetter { reason: String },
    /// Ack and forget; only on an explicit discard request
    Drop { reason: String },
}

pub struct RetryCoordinator {
    policy: RetryPolicy,
    publisher: Arc<Publisher>,
    routes: Arc<DeadLetterRoutes>,
}

impl RetryCoordinator {
    pub fn new(
        policy: RetryPolicy,
        publisher: Arc<Publisher>,
        routes: Arc<DeadLetterRoutes>,
    ) -> Arc<RetryCoordinator> {
        Arc::new(RetryCoordinator {
            policy,
            publisher,
            routes,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn routes(&self) -> &Arc<DeadLetterRoutes> {
        &self.routes
    }

    pub fn on_handler_failure(&self, message: &InboundMessage, error: &HandlerError) -> Decision {
        match error.kind {
            HandlerErrorKind::Discard => Decision::Drop {
                reason: error.reason.clone(),
            },
            HandlerErrorKind::NonRetryable => Decision::DeadLetter {
                reason: error.reason.clone(),
            },
            HandlerErrorKind::Retryable if message.retry_count() < self.policy.max_retries => {
                Decision::Requeue {
                    delay: self.policy.delay_for(message.retry_count()),
                }
            }
            HandlerErrorKind::Retryable => Decision::DeadLetter {
                reason: format!(
                    "retries exhausted after {} attempts: {}",
                    message.retry_count(),
                    error.reason
                ),
            },
        }
    }

    /// Publishes a diagnostic copy of `message` to its dead-letter
    /// destination. The caller still settles the original delivery.
    pub async fn dead_letter(
        &self,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<DeadLetterRecord, PublishError> {
        let record = DeadLetterRecord::new(message, reason);
        let destination = self.routes.resolve(message.queue());

        let wire = WireMessage {
            exchange: destination.exchange.clone(),
            routing_key: destination.routing_key.clone(),
            body: record.payload.clone(),
            properties: MessageProperties {
                headers: record.augmented_headers(),
                persistent: true,
                ..message.properties().clone()
            },
        };

        match self
            .publisher
            .publish_wire(&wire, self.publisher.options())
            .await
        {
            Ok(()) => {
                self.publisher.metrics().dead_lettered();
                warn!(
                    message_id = message.message_id().unwrap_or_default(),
                    queue = message.queue(),
                    retry_count = record.retry_count,
                    reason,
                    exchange = destination.exchange,
                    routing_key = destination.routing_key,
                    "message dead-lettered"
                );
                Ok(record)
            }
            Err(err) => {
                self.publisher.metrics().dead_letter_failed();
                error!(
                    error = err.to_string(),
                    message_id = message.message_id().unwrap_or_default(),
                    queue = message.queue(),
                    reason,
                    "failure to dead-letter message"
                );
                Err(err)
            }
        }
    }

    /// Republishes a retry copy of `message` to its source queue.
    pub(crate) async fn requeue(&self, message: &InboundMessage) -> Result<(), PublishError> {
        self.publisher
            .publish_wire(&message.retry_copy(), self.publisher.options())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{HeaderValue, Headers, HEADER_DEAD_LETTER_REASON, HEADER_RETRY_COUNT},
        publisher::PublishOptions,
        queue::QueueDefinition,
        testing::{connected_manager, InMemoryBroker},
        topology::{ChannelTopology, Topology},
        transport::RawDelivery,
    };

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }

    fn message(queue: &str, retry_count: i64) -> InboundMessage {
        let mut headers = Headers::new();
        headers.insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::Int(retry_count));
        InboundMessage::detached(
            queue,
            RawDelivery {
                delivery_tag: 1,
                exchange: "jobs".to_owned(),
                routing_key: "jobs.completed".to_owned(),
                redelivered: false,
                body: br#"{"jobId":"j3"}"#.to_vec(),
                properties: MessageProperties {
                    message_id: Some("m3".to_owned()),
                    headers,
                    ..MessageProperties::default()
                },
                death_count: 0,
            },
        )
    }

    async fn coordinator(broker: &InMemoryBroker) -> Arc<RetryCoordinator> {
        let manager = connected_manager(broker).await;
        let routes = Arc::new(DeadLetterRoutes::default());
        ChannelTopology::new(manager.clone(), routes.clone())
            .declare(
                &Topology::new()
                    .queue(QueueDefinition::new("notifications").with_dlq())
                    .queue(QueueDefinition::new("dead-letters")),
            )
            .await
            .expect("declared");
        let publisher = Publisher::new(manager, PublishOptions::default());
        RetryCoordinator::new(policy(), publisher, routes)
    }

    #[test]
    fn delay_doubles_with_retry_count_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(5));
        assert_eq!(p.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn decisions_follow_error_kind_and_budget() {
        let broker = InMemoryBroker::new();
        let coordinator = coordinator(&broker).await;

        assert_eq!(
            coordinator.on_handler_failure(&message("q", 1), &HandlerError::retryable("db")),
            Decision::Requeue {
                delay: Duration::from_secs(2)
            }
        );
        assert!(matches!(
            coordinator.on_handler_failure(&message("q", 3), &HandlerError::retryable("db")),
            Decision::DeadLetter { .. }
        ));
        assert_eq!(
            coordinator.on_handler_failure(&message("q", 0), &HandlerError::non_retryable("bad")),
            Decision::DeadLetter {
                reason: "bad".to_owned()
            }
        );
        assert_eq!(
            coordinator.on_handler_failure(&message("q", 0), &HandlerError::discard("dup")),
            Decision::Drop {
                reason: "dup".to_owned()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letters_to_the_queue_dlq() {
        let broker = InMemoryBroker::new();
        let coordinator = coordinator(&broker).await;

        let record = coordinator
            .dead_letter(&message("notifications", 3), "boom")
            .await
            .expect("dead-lettered");
        assert_eq!(record.retry_count, 3);

        let dead = broker.drain("notifications-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].properties.headers.get(HEADER_DEAD_LETTER_REASON),
            Some(&HeaderValue::from("boom"))
        );
        assert_eq!(dead[0].properties.message_id.as_deref(), Some("m3"));
        assert_eq!(coordinator.publisher.metrics().snapshot().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_queues_use_the_fallback_destination() {
        let broker = InMemoryBroker::new();
        let coordinator = coordinator(&broker).await;

        coordinator
            .dead_letter(&message("elsewhere", 0), "poison")
            .await
            .expect("dead-lettered");
        assert_eq!(broker.queue_depth("dead-letters"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_without_a_destination_queue_fails() {
        let broker = InMemoryBroker::new();
        let manager = connected_manager(&broker).await;
        let routes = Arc::new(DeadLetterRoutes::default());
        ChannelTopology::new(manager.clone(), routes.clone())
            .declare(&Topology::new().queue(QueueDefinition::new("orders")))
            .await
            .expect("declared");
        let publisher = Publisher::new(manager, PublishOptions::default());
        let coordinator = RetryCoordinator::new(policy(), publisher, routes);

        let err = coordinator
            .dead_letter(&message("orders", 0), "boom")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Unroutable { ref routing_key, .. } if routing_key == "dead-letters"
        ));
        let snapshot = coordinator.publisher.metrics().snapshot();
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(snapshot.dead_letter_failures, 1);
        assert_eq!(snapshot.publish_failure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dead_letter_is_counted_separately() {
        let broker = InMemoryBroker::new();
        let coordinator = coordinator(&broker).await;
        coordinator.publisher.close();

        let err = coordinator
            .dead_letter(&message("notifications", 3), "boom")
            .await
            .unwrap_err();

        assert_eq!(err, PublishError::ShuttingDown);
        let snapshot = coordinator.publisher.metrics().snapshot();
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(snapshot.dead_letter_failures, 1);
    }
}
