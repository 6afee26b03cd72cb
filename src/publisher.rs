// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes [`OutboundMessage`]s, writes them on the current channel and
//! waits for the broker confirm. Sends are serialized by a lock held only
//! around the channel write, so messages published in sequence from one task
//! keep their order on the wire while confirms of concurrent publishes are
//! awaited in parallel.
//!
//! Transient failures (no connection yet, closed channel, nack, confirm
//! timeout) are retried with jittered exponential backoff. Serialization
//! errors, unroutable messages and fatal connection failures are returned at
//! once. Every message is published as mandatory so the broker returns it
//! instead of silently dropping it when no queue is bound.

use crate::{
    backoff::BackoffPolicy,
    config::PublishConfig,
    connection::ConnectionManager,
    errors::{ConnectionError, PublishError, TransportError},
    message::OutboundMessage,
    metrics::Metrics,
    otel,
    transport::{Confirmation, WireMessage},
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time};
use tracing::{debug, error, warn};

/// Per-call publish settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// How long to wait for the broker confirm of one attempt
    pub confirm_timeout: Duration,
    /// Attempts after the first one
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl PublishOptions {
    pub fn from_config(cfg: &PublishConfig) -> Self {
        PublishOptions {
            confirm_timeout: cfg.confirm_timeout(),
            max_retries: cfg.max_retries,
            backoff: cfg.policy(),
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions::from_config(&PublishConfig::default())
    }
}

enum AttemptError {
    /// Worth another attempt
    Transient(PublishError),
    Fatal(PublishError),
}

pub struct Publisher {
    manager: Arc<ConnectionManager>,
    options: PublishOptions,
    send: Mutex<()>,
    closed: AtomicBool,
}

impl Publisher {
    /// Creates a publisher sending through `manager`'s current connection.
    ///
    /// # Parameters
    /// * `manager` - Connection manager handing out live channels
    /// * `options` - Defaults applied by [`publish`](Publisher::publish)
    ///
    /// # Returns
    /// * `Arc<Publisher>` - shared by producers and the retry coordinator
    pub fn new(manager: Arc<ConnectionManager>, options: PublishOptions) -> Arc<Publisher> {
        Arc::new(Publisher {
            manager,
            options,
            send: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Defaults applied by [`publish`](Publisher::publish).
    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.manager.metrics()
    }

    /// Publishes `message` with the default options, propagating `ctx`
    /// through the message headers.
    pub async fn publish<T: Serialize>(
        &self,
        ctx: &Context,
        message: &OutboundMessage<T>,
    ) -> Result<(), PublishError> {
        self.publish_with(ctx, message, &self.options).await
    }

    pub async fn publish_with<T: Serialize>(
        &self,
        ctx: &Context,
        message: &OutboundMessage<T>,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        let mut wire = match message.to_wire() {
            Ok(wire) => wire,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    message_id = message.message_id(),
                    "failure to serialize message"
                );
                self.metrics().publish_failed();
                return Err(err);
            }
        };

        otel::inject(ctx, &mut wire.properties.headers);

        self.publish_wire(&wire, options).await
    }

    /// Stops accepting publishes. Calls already in flight finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Retry loop shared by producers, requeues and dead-letters.
    pub(crate) async fn publish_wire(
        &self,
        wire: &WireMessage,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::ShuttingDown);
        }

        let message_id = wire.properties.message_id.as_deref().unwrap_or_default();
        let attempts = options.max_retries.saturating_add(1);
        let mut schedule = options.backoff.schedule();
        let mut last_error = PublishError::Timeout;

        for attempt in 1..=attempts {
            self.metrics().publish_attempt();

            match self.attempt(wire, options.confirm_timeout).await {
                Ok(()) => {
                    debug!(message_id, attempt, "message published");
                    self.metrics().publish_succeeded();
                    return Ok(());
                }
                Err(AttemptError::Fatal(err)) => {
                    error!(error = err.to_string(), message_id, "failure to publish message");
                    self.metrics().publish_failed();
                    return Err(err);
                }
                Err(AttemptError::Transient(err)) => last_error = err,
            }

            if attempt < attempts {
                let delay = schedule.next_delay();
                warn!(
                    error = last_error.to_string(),
                    message_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "publish attempt failed, retrying"
                );
                time::sleep(delay).await;
            }
        }

        error!(
            error = last_error.to_string(),
            message_id, attempts, "publish retries exhausted"
        );
        self.metrics().publish_failed();

        if attempts == 1 {
            return Err(last_error);
        }
        Err(PublishError::Exhausted {
            attempts,
            reason: last_error.to_string(),
        })
    }

    async fn attempt(
        &self,
        wire: &WireMessage,
        confirm_timeout: Duration,
    ) -> Result<(), AttemptError> {
        let conn = match self.manager.ensure_connected().await {
            Ok(conn) => conn,
            Err(ConnectionError::Timeout) => {
                return Err(AttemptError::Transient(PublishError::Connection(
                    ConnectionError::Timeout,
                )))
            }
            Err(ConnectionError::ShuttingDown) => {
                return Err(AttemptError::Fatal(PublishError::ShuttingDown))
            }
            Err(err) => return Err(AttemptError::Fatal(PublishError::Connection(err))),
        };

        let confirm = {
            let _send = self.send.lock().await;
            conn.channel().publish(wire).await
        };

        let confirm = match confirm {
            Ok(confirm) => confirm,
            Err(err) => {
                if !matches!(err, TransportError::Closed) {
                    self.manager
                        .report_failure(&conn, "publish failed on channel")
                        .await;
                }
                return Err(AttemptError::Transient(PublishError::Send(err.to_string())));
            }
        };

        match time::timeout(confirm_timeout, confirm).await {
            Ok(Ok(Confirmation::Ack)) | Ok(Ok(Confirmation::NotRequested)) => {
                conn.touch();
                Ok(())
            }
            Ok(Ok(Confirmation::Nack)) => Err(AttemptError::Transient(PublishError::Nacked)),
            Ok(Ok(Confirmation::Unroutable)) => {
                conn.touch();
                Err(AttemptError::Fatal(PublishError::Unroutable {
                    exchange: wire.exchange.clone(),
                    routing_key: wire.routing_key.clone(),
                }))
            }
            Ok(Err(err)) => Err(AttemptError::Transient(PublishError::Send(err.to_string()))),
            Err(_) => {
                warn!(
                    timeout_ms = confirm_timeout.as_millis() as u64,
                    "publisher confirm timed out"
                );
                Err(AttemptError::Transient(PublishError::Timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionState,
        exchange::ExchangeDefinition,
        queue::{QueueBinding, QueueDefinition},
        retry::DeadLetterRoutes,
        testing::{connected_manager, InMemoryBroker},
        topology::{ChannelTopology, Topology},
    };
    use serde_json::json;

    fn options() -> PublishOptions {
        PublishOptions {
            confirm_timeout: Duration::from_millis(200),
            max_retries: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    async fn declared(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let manager = connected_manager(broker).await;
        let topology =
            ChannelTopology::new(manager.clone(), Arc::new(DeadLetterRoutes::default()));
        topology
            .declare(
                &Topology::new()
                    .exchange(ExchangeDefinition::new("jobs").topic())
                    .queue(QueueDefinition::new("notifications"))
                    .queue_binding(
                        QueueBinding::new("notifications")
                            .exchange("jobs")
                            .routing_key("jobs.*"),
                    ),
            )
            .await
            .expect("declared");
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_and_counts() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());

        let message = OutboundMessage::new("jobs", "jobs.completed", json!({"jobId": "j1"}));
        publisher
            .publish(&Context::new(), &message)
            .await
            .expect("published");

        assert_eq!(broker.queue_depth("notifications"), 1);
        let snapshot = publisher.metrics().snapshot();
        assert_eq!(snapshot.publish_attempts, 1);
        assert_eq!(snapshot.publish_success, 1);
        assert_eq!(snapshot.publish_failure, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_publish_is_retried() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());
        broker.nack_next_publishes(2);

        let message = OutboundMessage::new("jobs", "jobs.completed", json!({}));
        publisher
            .publish(&Context::new(), &message)
            .await
            .expect("published on third attempt");

        assert_eq!(broker.queue_depth("notifications"), 1);
        assert_eq!(publisher.metrics().snapshot().publish_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn withheld_confirms_exhaust_the_budget() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());
        broker.withhold_confirms(true);

        let message = OutboundMessage::new("jobs", "jobs.completed", json!({}));
        let err = publisher.publish(&Context::new(), &message).await.unwrap_err();

        assert!(matches!(err, PublishError::Exhausted { attempts: 4, .. }));
        assert_eq!(publisher.metrics().snapshot().publish_failure, 1);

        let once = options().with_max_retries(0);
        let err = publisher
            .publish_with(&Context::new(), &message, &once)
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn unroutable_messages_fail_without_retry() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());

        let message = OutboundMessage::new("jobs", "billing.paid", json!({}));
        let err = publisher.publish(&Context::new(), &message).await.unwrap_err();

        assert_eq!(
            err,
            PublishError::Unroutable {
                exchange: "jobs".to_owned(),
                routing_key: "billing.paid".to_owned(),
            }
        );
        let snapshot = publisher.metrics().snapshot();
        assert_eq!(snapshot.publish_attempts, 1);
        assert_eq!(snapshot.publish_success, 0);
        assert_eq!(snapshot.publish_failure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_publishes_keep_their_order() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());

        for i in 0..10 {
            let message = OutboundMessage::new("jobs", "jobs.completed", json!({ "seq": i }));
            publisher
                .publish(&Context::new(), &message)
                .await
                .expect("published");
        }

        let order: Vec<serde_json::Value> = broker
            .drain("notifications")
            .iter()
            .map(|d| serde_json::from_slice(&d.body).expect("json body"))
            .collect();
        let expected: Vec<serde_json::Value> = (0..10).map(|i| json!({ "seq": i })).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn serialization_errors_are_not_retried() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());

        let mut payload = std::collections::HashMap::new();
        payload.insert((1, 2), "tuple keys");
        let message = OutboundMessage::new("jobs", "jobs.completed", payload);

        let err = publisher.publish(&Context::new(), &message).await.unwrap_err();
        assert!(matches!(err, PublishError::Serialization(_)));
        assert_eq!(publisher.metrics().snapshot().publish_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_publisher_rejects_messages() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(declared(&broker).await, options());
        publisher.close();

        let message = OutboundMessage::new("jobs", "jobs.completed", json!({}));
        assert_eq!(
            publisher.publish(&Context::new(), &message).await,
            Err(PublishError::ShuttingDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_survives_a_dropped_connection() {
        let broker = InMemoryBroker::new();
        let manager = declared(&broker).await;
        let publisher = Publisher::new(manager.clone(), options());
        broker.drop_connections();

        let message = OutboundMessage::new("jobs", "jobs.completed", json!({}));
        publisher
            .publish(&Context::new(), &message)
            .await
            .expect("published after reconnect");

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.queue_depth("notifications"), 1);
        assert_eq!(broker.connect_count(), 2);
    }
}
