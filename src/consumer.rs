// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Delivers [`InboundMessage`]s from a queue to a [`MessageHandler`]. Every
//! registration runs its own supervisor task that attaches to the current
//! channel, pulls deliveries while it holds a prefetch slot, and hands each one
//! to a bounded pool of handler executions. When the delivery stream ends
//! (connection loss, broker cancel) the supervisor reattaches on the next
//! connection handed out by the [`ConnectionManager`].
//!
//! A handler returning `Ok` gets its message acked. Failures, including a
//! handler outliving the visibility timeout, are passed to the
//! [`RetryCoordinator`] which decides between requeue, dead-letter and drop.
//! Each delivery is processed under a consumer span continuing the producer's
//! trace.

use crate::{
    backoff::BackoffPolicy,
    config::BrokerConfig,
    connection::{Connection, ConnectionManager},
    errors::{ConnectionError, ConsumerError, HandlerError},
    message::{InboundMessage, Settlement},
    metrics::Metrics,
    otel,
    retry::{Decision, RetryCoordinator},
    transport::{ConsumeRequest, DeliveryStream, RawDelivery},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Reason recorded on messages explicitly rejected through [`Consumer::nack`].
pub const REJECTED_BY_CONSUMER: &str = "rejected by consumer";

/// Application code processing deliveries.
///
/// Returning `Ok` acks the message unless the handler already settled it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

/// Per-registration settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries held by this registration
    pub prefetch: u16,
    /// Ack each delivery as soon as it is taken for processing, before the
    /// handler runs. The broker still enforces `prefetch`.
    pub auto_ack: bool,
    /// Concurrent handler executions, defaults to `prefetch`
    pub workers: Option<usize>,
    pub visibility_timeout: Duration,
    pub exclusive: bool,
    pub consumer_tag: Option<String>,
}

impl SubscribeOptions {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        SubscribeOptions {
            prefetch: cfg.consumer.prefetch,
            auto_ack: false,
            workers: cfg.consumer.workers,
            visibility_timeout: cfg.consumer.visibility_timeout(),
            exclusive: false,
            consumer_tag: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    fn prefetch_limit(&self) -> usize {
        usize::from(self.prefetch.max(1))
    }

    fn worker_limit(&self) -> usize {
        self.workers.unwrap_or_else(|| self.prefetch_limit()).max(1)
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions::from_config(&BrokerConfig::default())
    }
}

/// Consumer-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Applied by [`Consumer::subscribe`]
    pub subscribe: SubscribeOptions,
    /// Bound on the wait for in-flight handlers at unsubscribe and shutdown
    pub shutdown_grace: Duration,
    /// Delays between failed reattach attempts
    pub reattach: BackoffPolicy,
}

impl ConsumerOptions {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        ConsumerOptions {
            subscribe: SubscribeOptions::from_config(cfg),
            shutdown_grace: cfg.consumer.shutdown_grace(),
            reattach: cfg.reconnect.policy(),
        }
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions::from_config(&BrokerConfig::default())
    }
}

/// Handle of an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    consumer_tag: String,
    queue: String,
}

impl ConsumerRegistration {
    /// Tag identifying the subscription on the broker, stable across
    /// reattaches.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Queue this registration consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

struct Registration {
    worker: Arc<Worker>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Consumer {
    manager: Arc<ConnectionManager>,
    coordinator: Arc<RetryCoordinator>,
    options: ConsumerOptions,
    registrations: Mutex<HashMap<String, Registration>>,
    closing: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        coordinator: Arc<RetryCoordinator>,
        options: ConsumerOptions,
    ) -> Arc<Consumer> {
        let (closing, _) = watch::channel(false);
        Arc::new(Consumer {
            manager,
            coordinator,
            options,
            registrations: Mutex::new(HashMap::new()),
            closing,
        })
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Subscribes with the consumer-wide defaults.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerRegistration, ConsumerError> {
        self.subscribe_with(queue, handler, self.options.subscribe.clone())
            .await
    }

    /// Starts delivering messages from `queue` to `handler`. The first attach
    /// happens before returning, so a missing queue or an exclusive clash is
    /// reported here.
    pub async fn subscribe_with(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<ConsumerRegistration, ConsumerError> {
        if *self.closing.borrow() {
            return Err(ConsumerError::ShuttingDown);
        }

        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{queue}-{}", Uuid::new_v4().simple()));
        let worker = Arc::new(Worker {
            request: ConsumeRequest {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.clone(),
                prefetch: options.prefetch.max(1),
                exclusive: options.exclusive,
            },
            prefetch: Arc::new(Semaphore::new(options.prefetch_limit())),
            workers: Arc::new(Semaphore::new(options.worker_limit())),
            options,
            handler,
            manager: self.manager.clone(),
            coordinator: self.coordinator.clone(),
            reattach: self.options.reattach,
            tracer: global::tracer("amqp-relay consumer"),
        });

        let conn = self.manager.ensure_connected().await?;
        let stream = conn
            .channel()
            .consume(&worker.request)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue, consumer_tag, "failure to create the consumer"
                );
                ConsumerError::Subscribe {
                    queue: queue.to_owned(),
                    reason: err.to_string(),
                }
            })?;
        self.metrics().consumer_attached();
        info!(
            queue,
            consumer_tag,
            prefetch = worker.options.prefetch,
            workers = worker.options.worker_limit(),
            "consumer attached"
        );

        // shutdown may have drained the registrations while we were attaching
        let registered = match self.registrations.lock() {
            Ok(mut registrations) if !*self.closing.borrow() => {
                let (stop, stopped) = watch::channel(false);
                let task = tokio::spawn(supervise(worker.clone(), conn.clone(), stream, stopped));
                registrations.insert(
                    consumer_tag.clone(),
                    Registration { worker, stop, task },
                );
                true
            }
            _ => false,
        };

        if !registered {
            if let Err(err) = conn.channel().cancel(&consumer_tag).await {
                warn!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
            }
            self.metrics().consumer_detached();
            info!(queue, consumer_tag, "consumer closing, subscription cancelled");
            return Err(ConsumerError::ShuttingDown);
        }

        Ok(ConsumerRegistration {
            consumer_tag,
            queue: queue.to_owned(),
        })
    }

    /// Stops deliveries for `registration` and waits, bounded by the shutdown
    /// grace, for its in-flight handlers.
    pub async fn unsubscribe(&self, registration: &ConsumerRegistration) -> Result<(), ConsumerError> {
        let entry = self
            .registrations
            .lock()
            .ok()
            .and_then(|mut r| r.remove(registration.consumer_tag()));
        let Some(entry) = entry else {
            return Err(ConsumerError::UnknownRegistration(
                registration.consumer_tag().to_owned(),
            ));
        };

        self.stop(vec![entry]).await;
        Ok(())
    }

    /// Confirms processing of `message`.
    pub async fn ack(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
        message.settle(Settlement::Ack).await
    }

    /// Rejects `message`. With `requeue` it is redelivered with its retry count
    /// incremented; otherwise it is dead-lettered right away.
    pub async fn nack(&self, message: &InboundMessage, requeue: bool) -> Result<(), ConsumerError> {
        if message.is_settled() {
            return Ok(());
        }

        let decision = if requeue {
            Decision::Requeue {
                delay: Duration::ZERO,
            }
        } else {
            Decision::DeadLetter {
                reason: REJECTED_BY_CONSUMER.to_owned(),
            }
        };
        apply(&self.coordinator, message, decision).await
    }

    /// Stops every registration. In-flight handlers get the shutdown grace to
    /// finish; whatever is still unsettled afterwards is redelivered by the
    /// broker once the connection closes.
    pub async fn shutdown(&self) {
        if self.closing.send_replace(true) {
            return;
        }

        let entries: Vec<Registration> = self
            .registrations
            .lock()
            .map(|mut r| r.drain().map(|(_, entry)| entry).collect())
            .unwrap_or_default();
        info!(registrations = entries.len(), "shutting down consumer");
        self.stop(entries).await;
    }

    pub fn registrations(&self) -> Vec<ConsumerRegistration> {
        self.registrations
            .lock()
            .map(|r| {
                r.iter()
                    .map(|(tag, entry)| ConsumerRegistration {
                        consumer_tag: tag.clone(),
                        queue: entry.worker.request.queue.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metrics(&self) -> &Arc<Metrics> {
        self.manager.metrics()
    }

    async fn stop(&self, entries: Vec<Registration>) {
        for entry in &entries {
            let _ = entry.stop.send(true);
        }

        let deadline = time::Instant::now() + self.options.shutdown_grace;
        for entry in entries {
            let tag = entry.worker.request.consumer_tag.clone();
            if time::timeout_at(deadline, entry.task).await.is_err() {
                warn!(consumer_tag = tag, "consumer supervisor did not stop in time");
            }

            let slots = entry.worker.options.prefetch_limit() as u32;
            match time::timeout_at(deadline, entry.worker.prefetch.acquire_many(slots)).await {
                Ok(_) => debug!(consumer_tag = tag, "in-flight handlers drained"),
                Err(_) => warn!(
                    consumer_tag = tag,
                    in_flight = slots as usize - entry.worker.prefetch.available_permits(),
                    "shutdown grace elapsed with handlers still running"
                ),
            }
        }
    }
}

/// State shared by a registration's supervisor and its handler executions.
struct Worker {
    request: ConsumeRequest,
    options: SubscribeOptions,
    handler: Arc<dyn MessageHandler>,
    manager: Arc<ConnectionManager>,
    coordinator: Arc<RetryCoordinator>,
    /// Unsettled deliveries held by the registration
    prefetch: Arc<Semaphore>,
    /// Concurrent handler executions
    workers: Arc<Semaphore>,
    reattach: BackoffPolicy,
    tracer: BoxedTracer,
}

impl Worker {
    fn metrics(&self) -> &Arc<Metrics> {
        self.manager.metrics()
    }

    /// Attaches to the current connection, waiting through reconnects.
    /// Returns `None` once stopped or when the manager gave up.
    async fn reattach(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<Connection>, DeliveryStream)> {
        let mut schedule = self.reattach.schedule();
        let tag = &self.request.consumer_tag;

        loop {
            if *stop.borrow() {
                return None;
            }

            let attached = tokio::select! {
                conn = self.manager.ensure_connected() => conn,
                _ = stop.wait_for(|s| *s) => return None,
            };

            match attached {
                Ok(conn) => match conn.channel().consume(&self.request).await {
                    Ok(stream) => {
                        self.metrics().consumer_attached();
                        info!(
                            consumer_tag = tag,
                            queue = self.request.queue,
                            generation = conn.generation(),
                            "consumer reattached"
                        );
                        return Some((conn, stream));
                    }
                    Err(err) => {
                        let delay = schedule.next_delay();
                        warn!(
                            error = err.to_string(),
                            consumer_tag = tag,
                            delay_ms = delay.as_millis() as u64,
                            "failure to reattach consumer"
                        );
                        tokio::select! {
                            _ = time::sleep(delay) => {}
                            _ = stop.wait_for(|s| *s) => return None,
                        }
                    }
                },
                Err(ConnectionError::Timeout) => {}
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        consumer_tag = tag,
                        "consumer stopped, no connection will be available"
                    );
                    return None;
                }
            }
        }
    }

    async fn process(
        self: Arc<Self>,
        conn: Arc<Connection>,
        delivery: RawDelivery,
        _slot: OwnedSemaphorePermit,
    ) {
        let Ok(_worker) = self.workers.clone().acquire_owned().await else {
            return;
        };

        let span_name = delivery
            .properties
            .kind
            .clone()
            .unwrap_or_else(|| self.request.queue.clone());
        let (ctx, mut span) = otel::new_span(&delivery.properties.headers, &self.tracer, &span_name);
        let message = InboundMessage::from_delivery(
            &self.request.queue,
            delivery,
            conn,
            self.options.auto_ack,
            ctx,
            self.metrics().clone(),
        );

        debug!(
            message_id = message.message_id().unwrap_or_default(),
            kind = message.kind().unwrap_or_default(),
            queue = message.queue(),
            retry_count = message.retry_count(),
            "received message"
        );

        let timeout = self.options.visibility_timeout;
        let outcome = match time::timeout(timeout, self.handler.handle(&message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::retryable(format!(
                "handler exceeded the visibility timeout of {}ms",
                timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(()) => {
                debug!(
                    message_id = message.message_id().unwrap_or_default(),
                    "message successfully processed"
                );
                if let Err(err) = message.settle(Settlement::Ack).await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to ack message"),
                    });
                    return;
                }
                span.set_status(Status::Ok);
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.reason.clone()),
                });

                if message.is_settled() {
                    return;
                }
                let decision = self.coordinator.on_handler_failure(&message, &err);
                let _ = apply(&self.coordinator, &message, decision).await;
            }
        }
    }
}

/// Carries out a retry decision and settles the original delivery.
async fn apply(
    coordinator: &RetryCoordinator,
    message: &InboundMessage,
    decision: Decision,
) -> Result<(), ConsumerError> {
    let message_id = message.message_id().unwrap_or_default();

    match decision {
        Decision::Requeue { delay } => {
            warn!(
                message_id,
                queue = message.queue(),
                retry_count = message.retry_count(),
                delay_ms = delay.as_millis() as u64,
                "requeuing message"
            );
            time::sleep(delay).await;

            match coordinator.requeue(message).await {
                Ok(()) => message.settle(Settlement::Requeued).await,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        message_id, "failure to republish retry, handing back to the broker"
                    );
                    message.settle(Settlement::BrokerRequeue).await
                }
            }
        }
        Decision::DeadLetter { reason } => match coordinator.dead_letter(message, &reason).await {
            Ok(_) => message.settle(Settlement::DeadLettered).await,
            Err(_) => message.settle(Settlement::BrokerReject).await,
        },
        Decision::Drop { reason } => {
            warn!(
                message_id,
                queue = message.queue(),
                reason,
                "dropping message on handler request"
            );
            message.settle(Settlement::Dropped).await
        }
    }
}

/// Pulls deliveries for one registration until it is stopped. Reattaches
/// whenever the delivery stream ends.
async fn supervise(
    worker: Arc<Worker>,
    mut conn: Arc<Connection>,
    mut stream: DeliveryStream,
    mut stop: watch::Receiver<bool>,
) {
    let tag = worker.request.consumer_tag.clone();

    loop {
        let slot = tokio::select! {
            slot = worker.prefetch.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
            _ = stop.wait_for(|s| *s) => break,
        };

        let next = tokio::select! {
            next = stream.next() => next,
            _ = stop.wait_for(|s| *s) => break,
        };

        match next {
            Some(Ok(delivery)) => {
                if worker.options.auto_ack {
                    if let Err(err) = conn.channel().ack(delivery.delivery_tag).await {
                        // still unacked on the broker, which redelivers it
                        warn!(
                            error = err.to_string(),
                            consumer_tag = tag,
                            delivery_tag = delivery.delivery_tag,
                            "failure to auto-ack delivery, leaving it to the broker"
                        );
                        continue;
                    }
                }
                worker.metrics().delivery_received();
                tokio::spawn(worker.clone().process(conn.clone(), delivery, slot));
            }
            Some(Err(err)) => {
                warn!(error = err.to_string(), consumer_tag = tag, "delivery error");
            }
            None => {
                drop(slot);
                worker.metrics().consumer_detached();
                warn!(consumer_tag = tag, "delivery stream ended, reattaching");

                match worker.reattach(&mut stop).await {
                    Some((next_conn, next_stream)) => {
                        conn = next_conn;
                        stream = next_stream;
                    }
                    None => return,
                }
            }
        }
    }

    if conn.is_open() {
        if let Err(err) = conn.channel().cancel(&tag).await {
            warn!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
        }
    }
    worker.metrics().consumer_detached();
    info!(consumer_tag = tag, "consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{HeaderValue, HEADER_DEAD_LETTER_REASON},
        publisher::{PublishOptions, Publisher},
        queue::QueueDefinition,
        retry::{DeadLetterRoutes, RetryPolicy},
        testing::{connected_manager, InMemoryBroker},
        topology::{ChannelTopology, Topology},
        transport::{MessageProperties, WireMessage},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        broker: InMemoryBroker,
        manager: Arc<ConnectionManager>,
        publisher: Arc<Publisher>,
        consumer: Arc<Consumer>,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let manager = connected_manager(&broker).await;
        let routes = Arc::new(DeadLetterRoutes::default());
        ChannelTopology::new(manager.clone(), routes.clone())
            .declare(&Topology::new().queue(QueueDefinition::new("notifications").with_dlq()))
            .await
            .expect("declared");

        let publisher = Publisher::new(manager.clone(), PublishOptions::default());
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let coordinator = RetryCoordinator::new(policy, publisher.clone(), routes);
        let consumer = Consumer::new(manager.clone(), coordinator, ConsumerOptions::default());

        Fixture {
            broker,
            manager,
            publisher,
            consumer,
        }
    }

    fn inject(broker: &InMemoryBroker, id: &str) {
        broker
            .inject(&WireMessage {
                exchange: String::new(),
                routing_key: "notifications".to_owned(),
                body: br#"{"jobId":"j1"}"#.to_vec(),
                properties: MessageProperties {
                    message_id: Some(id.to_owned()),
                    kind: Some("job.completed".to_owned()),
                    ..MessageProperties::default()
                },
            })
            .expect("routed");
    }

    async fn settle_down() {
        time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_handling_acks() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_| Ok(()));

        f.consumer
            .subscribe("notifications", Arc::new(handler))
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        assert_eq!(f.broker.queue_depth("notifications"), 0);
        assert_eq!(f.broker.unacked_count("notifications"), 0);
        let snapshot = f.manager.metrics().snapshot();
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.unacked, 0);
        assert_eq!(snapshot.consumer_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_acks_and_counts_a_drop() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::discard("duplicate")));

        f.consumer
            .subscribe("notifications", Arc::new(handler))
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        assert_eq!(f.broker.queue_depth("notifications-dlq"), 0);
        assert_eq!(f.broker.unacked_count("notifications"), 0);
        assert_eq!(f.manager.metrics().snapshot().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_timeout_counts_as_a_retryable_failure() {
        let f = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        struct Hanging(Arc<AtomicUsize>);

        #[async_trait]
        impl MessageHandler for Hanging {
            async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                if message.retry_count() == 0 {
                    time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(())
            }
        }

        let options = SubscribeOptions::default().with_visibility_timeout(Duration::from_secs(1));
        f.consumer
            .subscribe_with("notifications", Arc::new(Hanging(seen)), options)
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = f.manager.metrics().snapshot();
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_nack_without_requeue_dead_letters() {
        let f = fixture().await;
        let consumer = f.consumer.clone();

        struct Rejecting(Arc<Consumer>);

        #[async_trait]
        impl MessageHandler for Rejecting {
            async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
                self.0
                    .nack(message, false)
                    .await
                    .map_err(|err| HandlerError::retryable(err.to_string()))
            }
        }

        f.consumer
            .subscribe("notifications", Arc::new(Rejecting(consumer)))
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        let dead = f.broker.drain("notifications-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].properties.headers.get(HEADER_DEAD_LETTER_REASON),
            Some(&HeaderValue::from(REJECTED_BY_CONSUMER))
        );
        assert_eq!(f.broker.unacked_count("notifications"), 0);
        assert_eq!(f.manager.metrics().snapshot().acked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribing_to_a_missing_queue_fails() {
        let f = fixture().await;
        let err = f
            .consumer
            .subscribe("missing", Arc::new(MockMessageHandler::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Subscribe { ref queue, .. } if queue == "missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_reattaches_after_a_dropped_connection() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(2).returning(|_| Ok(()));

        f.consumer
            .subscribe("notifications", Arc::new(handler))
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        f.broker.drop_connections();
        settle_down().await;
        assert_eq!(f.broker.consumer_count("notifications"), 1);

        inject(&f.broker, "m2");
        settle_down().await;
        assert_eq!(f.manager.metrics().snapshot().acked, 2);
        assert_eq!(f.manager.metrics().snapshot().consumer_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_deliveries() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(0);

        let registration = f
            .consumer
            .subscribe("notifications", Arc::new(handler))
            .await
            .expect("subscribed");
        assert_eq!(f.consumer.registrations(), vec![registration.clone()]);

        f.consumer.unsubscribe(&registration).await.expect("unsubscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        assert_eq!(f.broker.consumer_count("notifications"), 0);
        assert_eq!(f.broker.queue_depth("notifications"), 1);
        assert_eq!(f.manager.metrics().snapshot().consumer_count, 0);
        assert!(matches!(
            f.consumer.unsubscribe(&registration).await,
            Err(ConsumerError::UnknownRegistration(_))
        ));
    }

    /// Tracks how many handler executions overlap. Messages whose id starts
    /// with `slow` never finish.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Overlap {
        async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if message.message_id().unwrap_or_default().starts_with("slow") {
                std::future::pending::<()>().await;
            }
            time::sleep(Duration::from_secs(1)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_does_not_block_other_deliveries() {
        let f = fixture().await;
        let handler = Arc::new(Overlap::default());
        let options = SubscribeOptions::default()
            .with_prefetch(5)
            .with_visibility_timeout(Duration::from_secs(3_600));

        f.consumer
            .subscribe_with("notifications", handler.clone(), options)
            .await
            .expect("subscribed");
        inject(&f.broker, "slow-1");
        for i in 0..8 {
            inject(&f.broker, &format!("m{i}"));
        }
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(handler.done.load(Ordering::SeqCst), 8);
        assert_eq!(f.broker.unacked_count("notifications"), 1);
        assert_eq!(f.broker.queue_depth("notifications"), 0);
        assert_eq!(f.manager.metrics().snapshot().acked, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_limit_caps_concurrent_handlers() {
        let f = fixture().await;
        let handler = Arc::new(Overlap::default());
        let options = SubscribeOptions::default().with_prefetch(5).with_workers(2);

        f.consumer
            .subscribe_with("notifications", handler.clone(), options)
            .await
            .expect("subscribed");
        for i in 0..6 {
            inject(&f.broker, &format!("m{i}"));
        }
        time::sleep(Duration::from_millis(500)).await;

        // five deliveries held, two of them running
        assert_eq!(f.broker.unacked_count("notifications"), 5);
        assert_eq!(handler.running.load(Ordering::SeqCst), 2);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.done.load(Ordering::SeqCst), 6);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ack_keeps_the_prefetch_bound() {
        let f = fixture().await;
        let handler = Arc::new(Overlap::default());
        let options = SubscribeOptions::default()
            .with_prefetch(5)
            .with_auto_ack()
            .with_visibility_timeout(Duration::from_secs(3_600));
        for i in 0..100 {
            inject(&f.broker, &format!("slow-{i}"));
        }

        let registration = f
            .consumer
            .subscribe_with("notifications", handler.clone(), options)
            .await
            .expect("subscribed");
        time::sleep(Duration::from_secs(30)).await;

        // five acked and running, five more held unacked by the broker
        assert_eq!(handler.running.load(Ordering::SeqCst), 5);
        assert_eq!(f.broker.unacked_count("notifications"), 5);
        assert_eq!(f.broker.queue_depth("notifications"), 90);
        assert_eq!(f.manager.metrics().snapshot().unacked, 5);

        f.consumer.unsubscribe(&registration).await.expect("unsubscribed");
        f.broker.drop_connections();
        assert_eq!(f.broker.queue_depth("notifications"), 95);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ack_failed_requeue_is_reported() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::retryable("db down")));
        f.publisher.close();

        f.consumer
            .subscribe_with(
                "notifications",
                Arc::new(handler),
                SubscribeOptions::default().with_auto_ack(),
            )
            .await
            .expect("subscribed");
        inject(&f.broker, "m1");
        settle_down().await;

        assert_eq!(f.broker.unacked_count("notifications"), 0);
        assert_eq!(f.broker.queue_depth("notifications"), 0);
        let snapshot = f.manager.metrics().snapshot();
        assert_eq!(snapshot.dead_letter_failures, 1);
        assert_eq!(snapshot.requeued, 0);
        assert_eq!(snapshot.unacked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_attach_cancels_the_subscription() {
        let f = fixture().await;
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(0);
        f.broker.set_reachable(false);

        let pending = {
            let consumer = f.consumer.clone();
            tokio::spawn(async move {
                consumer
                    .subscribe("notifications", Arc::new(handler))
                    .await
            })
        };
        time::sleep(Duration::from_millis(10)).await;

        f.consumer.shutdown().await;
        f.broker.set_reachable(true);

        assert_eq!(pending.await.expect("joined"), Err(ConsumerError::ShuttingDown));
        assert!(f.consumer.registrations().is_empty());
        assert_eq!(f.broker.consumer_count("notifications"), 0);

        inject(&f.broker, "m1");
        settle_down().await;
        assert_eq!(f.broker.queue_depth("notifications"), 1);
        assert_eq!(f.manager.metrics().snapshot().consumer_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_subscriptions() {
        let f = fixture().await;
        f.consumer.shutdown().await;

        let err = f
            .consumer
            .subscribe("notifications", Arc::new(MockMessageHandler::new()))
            .await
            .unwrap_err();
        assert_eq!(err, ConsumerError::ShuttingDown);
    }
}
