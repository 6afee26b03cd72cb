// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A [`Transport`] holding exchanges, queues and deliveries in process memory.
//! It follows the AMQP 0-9-1 semantics the client relies on: direct, fanout
//! and topic routing, per-consumer prefetch, redelivery of unacked messages
//! when their channel closes, broker-side dead-lettering through the
//! `x-dead-letter-*` queue arguments, and publisher confirms.
//!
//! Outages and misbehaviour are injected through the control methods
//! ([`set_reachable`](InMemoryBroker::set_reachable),
//! [`drop_connections`](InMemoryBroker::drop_connections),
//! [`withhold_confirms`](InMemoryBroker::withhold_confirms)...), and state is
//! observed through the inspection methods.

use crate::{
    errors::TransportError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::HeaderValue,
    queue::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MAX_LENGTH,
    },
    transport::{
        BrokerChannel, Confirmation, ConfirmFuture, ConnectSettings, ConsumeRequest,
        DeliveryStream, MessageProperties, QueueDeclaration, RawDelivery, Transport,
        WireMessage,
    },
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    deaths: u32,
}

impl StoredMessage {
    fn from_wire(message: &WireMessage) -> Self {
        StoredMessage {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            properties: message.properties.clone(),
            redelivered: false,
            deaths: 0,
        }
    }

    fn to_delivery(&self, delivery_tag: u64) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            body: self.body.clone(),
            properties: self.properties.clone(),
            death_count: self.deaths,
        }
    }
}

struct Unacked {
    channel: u64,
    consumer_tag: String,
    message: StoredMessage,
}

struct MemConsumer {
    tag: String,
    channel: u64,
    prefetch: u16,
    exclusive: bool,
    in_flight: usize,
    deliveries: mpsc::UnboundedSender<Result<RawDelivery, TransportError>>,
}

impl MemConsumer {
    fn has_capacity(&self) -> bool {
        !self.deliveries.is_closed()
            && (self.prefetch == 0 || self.in_flight < usize::from(self.prefetch))
    }
}

struct MemQueue {
    declaration: QueueDeclaration,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<MemConsumer>,
    next_consumer: usize,
}

impl MemQueue {
    fn argument(&self, key: &str) -> Option<&HeaderValue> {
        self.declaration.arguments.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ChannelEntry {
    endpoint: String,
    closed: watch::Sender<bool>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    down: HashSet<String>,
    reject_credentials: bool,
    withhold_confirms: bool,
    nack_next: u32,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelEntry>,
    next_channel: u64,
    next_tag: u64,
    next_consumer_tag: u64,
    connects: u64,
    published: u64,
}

impl BrokerState {
    fn close_channel(&mut self, id: u64) {
        if let Some(entry) = self.channels.remove(&id) {
            debug!(channel = id, endpoint = entry.endpoint, "in-memory channel closed");
            let _ = entry.closed.send(true);
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };
            queue.consumers.retain(|c| c.channel != id);

            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }

            if queue.owner == Some(id) {
                self.queues.remove(name);
                self.bindings.retain(|b| &b.queue != name);
                continue;
            }
            self.prune_auto_delete(name);
            self.dispatch(name);
        }
    }

    fn prune_auto_delete(&mut self, name: &str) {
        let remove = self
            .queues
            .get(name)
            .map(|q| q.declaration.auto_delete && q.consumers.is_empty() && q.unacked.is_empty())
            .unwrap_or(false);
        if remove {
            self.queues.remove(name);
            self.bindings.retain(|b| b.queue != name);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            });
        }

        let def = self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, message: StoredMessage) -> Result<usize, TransportError> {
        let targets = self.route(&message.exchange, &message.routing_key)?;
        for name in &targets {
            let overflow = match self.queues.get_mut(name) {
                Some(queue) => {
                    queue.ready.push_back(message.clone());
                    let limit = queue
                        .argument(AMQP_HEADERS_MAX_LENGTH)
                        .and_then(HeaderValue::as_i64)
                        .and_then(|v| usize::try_from(v).ok());
                    match limit {
                        Some(limit) if queue.ready.len() > limit => queue.ready.pop_front(),
                        _ => None,
                    }
                }
                None => None,
            };
            // drop-head overflow dead-letters the oldest message
            if let Some(dropped) = overflow {
                self.dead_letter(name, dropped);
            }
        }
        for name in &targets {
            self.dispatch(name);
        }
        Ok(targets.len())
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(source) = self.queues.get(queue) else {
            return;
        };
        let Some(exchange) = source
            .argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            .and_then(HeaderValue::as_str)
            .map(str::to_owned)
        else {
            debug!(queue, "no dead-letter exchange, discarding message");
            return;
        };
        let routing_key = source
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .and_then(HeaderValue::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| message.routing_key.clone());

        message.exchange = exchange;
        message.routing_key = routing_key;
        message.redelivered = false;
        message.deaths = message.deaths.saturating_add(1);

        if let Err(err) = self.enqueue(message) {
            debug!(queue, error = err.to_string(), "dead-letter route failed");
        }
    }

    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        loop {
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                break;
            }
            let count = queue.consumers.len();
            let Some(slot) = (0..count)
                .map(|i| (queue.next_consumer + i) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let sent = queue.consumers[slot]
                .deliveries
                .send(Ok(message.to_delivery(tag)))
                .is_ok();
            if !sent {
                queue.consumers.remove(slot);
                queue.ready.push_front(message);
                continue;
            }

            queue.next_consumer = (slot + 1) % count;
            let consumer = &mut queue.consumers[slot];
            consumer.in_flight += 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    channel: consumer.channel,
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
        }
    }

    fn settle(&mut self, channel: u64, tag: u64, requeue: Option<bool>) -> Result<(), TransportError> {
        let name = self
            .queues
            .iter()
            .find(|(_, q)| q.unacked.get(&tag).is_some_and(|u| u.channel == channel))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                TransportError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {tag}"
                ))
            })?;

        let Some(queue) = self.queues.get_mut(&name) else {
            return Ok(());
        };
        let Some(unacked) = queue.unacked.remove(&tag) else {
            return Ok(());
        };
        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag && c.channel == channel)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match requeue {
            None => {}
            Some(true) => {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Some(false) => self.dead_letter(&name, unacked.message),
        }

        self.prune_auto_delete(&name);
        self.dispatch(&name);
        Ok(())
    }
}

/// Routes like a topic exchange: `*` matches one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && matches_words(rest, key_rest),
            None => false,
        },
    }
}

/// In-process AMQP broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_channel<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut BrokerState) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = self.lock();
        if !state.channels.contains_key(&id) {
            return Err(TransportError::Closed);
        }
        f(&mut state)
    }

    /// While unreachable every connect fails and open channels are closed.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.unreachable = !reachable;
        if !reachable {
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
        }
    }

    /// Takes a single endpoint down (closing its channels) or back up.
    pub fn set_endpoint_down(&self, endpoint: &str, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(endpoint.to_owned());
            let ids: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.endpoint == endpoint)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                state.close_channel(id);
            }
        } else {
            state.down.remove(endpoint);
        }
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    /// While set, publishes are swallowed and their confirms never resolve.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.lock().withhold_confirms = withhold;
    }

    /// The next `count` publishes are negatively confirmed and not enqueued.
    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().nack_next = count;
    }

    /// Closes every open channel. The broker stays reachable.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
    }

    /// Closes every channel and forgets non-durable exchanges and queues,
    /// like a broker restart.
    pub fn restart(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        state.exchanges.retain(|_, e| e.durable);
        state.queues.retain(|_, q| q.declaration.durable);
        let BrokerState {
            exchanges,
            queues,
            bindings,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
    }

    /// Routes a message as if a producer published it, bypassing channels.
    pub fn inject(&self, message: &WireMessage) -> Result<usize, TransportError> {
        let mut state = self.lock();
        state.published += 1;
        state.enqueue(StoredMessage::from_wire(message))
    }

    /// Messages waiting in `queue`, not counting unacked deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Removes and returns the ready messages of `queue`.
    pub fn drain(&self, queue: &str) -> Vec<RawDelivery> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Successful connects since creation.
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Messages accepted by the broker (including unroutable ones).
    pub fn publish_count(&self) -> u64 {
        self.lock().published
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(
        &self,
        endpoint: &str,
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let (id, closed) = {
            let mut state = self.lock();
            if state.unreachable || state.down.contains(endpoint) {
                return Err(TransportError::Unreachable(format!(
                    "connection refused: {endpoint}"
                )));
            }
            if state.reject_credentials {
                return Err(TransportError::AuthFailed(
                    "ACCESS_REFUSED - login was refused".to_owned(),
                ));
            }

            state.connects += 1;
            state.next_channel += 1;
            let id = state.next_channel;
            let (tx, rx) = watch::channel(false);
            state.channels.insert(
                id,
                ChannelEntry {
                    endpoint: endpoint.to_owned(),
                    closed: tx,
                },
            );
            (id, rx)
        };

        debug!(endpoint, channel = id, "in-memory channel opened");
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            confirms: settings.confirms,
            closed,
        }))
    }
}

fn confirmed(confirmation: Confirmation) -> ConfirmFuture {
    Box::pin(future::ready(Ok::<_, TransportError>(confirmation)))
}

struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    confirms: bool,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.broker.with_channel(self.id, |state| {
            if def.name.is_empty() {
                return Err(TransportError::Protocol(
                    "ACCESS_REFUSED - the default exchange cannot be declared".to_owned(),
                ));
            }
            match state.exchanges.get(&def.name) {
                Some(existing)
                    if existing.kind != def.kind
                        || existing.durable != def.durable
                        || existing.delete != def.delete
                        || existing.internal != def.internal =>
                {
                    Err(TransportError::PreconditionFailed(format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        def.name
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state.exchanges.insert(def.name.clone(), def.clone());
                    Ok(())
                }
            }
        })
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), TransportError> {
        let channel = self.id;
        self.broker.with_channel(channel, |state| {
            match state.queues.get(&declaration.name) {
                Some(existing) if existing.owner.is_some_and(|o| o != channel) => {
                    Err(TransportError::Protocol(format!(
                        "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                        declaration.name
                    )))
                }
                Some(existing)
                    if existing.declaration.durable != declaration.durable
                        || existing.declaration.exclusive != declaration.exclusive
                        || existing.declaration.auto_delete != declaration.auto_delete
                        || existing.declaration.arguments != declaration.arguments =>
                {
                    Err(TransportError::PreconditionFailed(format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        declaration.name
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        declaration.name.clone(),
                        MemQueue {
                            declaration: declaration.clone(),
                            owner: declaration.exclusive.then_some(channel),
                            ready: VecDeque::new(),
                            unacked: BTreeMap::new(),
                            consumers: vec![],
                            next_consumer: 0,
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.broker.with_channel(self.id, |state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(TransportError::Protocol(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            if !state.queues.contains_key(queue) {
                return Err(TransportError::Protocol(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            }
            let binding = Binding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(&self, message: &WireMessage) -> Result<ConfirmFuture, TransportError> {
        let confirms = self.confirms;
        let channel = self.id;
        self.broker.with_channel(channel, |state| {
            if state.withhold_confirms {
                return Ok(Box::pin(future::pending::<Result<Confirmation, TransportError>>())
                    as ConfirmFuture);
            }
            if state.nack_next > 0 {
                state.nack_next -= 1;
                return Ok(confirmed(Confirmation::Nack));
            }

            let routed = match state.enqueue(StoredMessage::from_wire(message)) {
                Ok(routed) => routed,
                Err(err) => {
                    // a failed publish closes the channel in AMQP
                    state.close_channel(channel);
                    return Err(err);
                }
            };
            state.published += 1;

            // every publish is mandatory: a message no queue took is returned
            let confirmation = match (confirms, routed) {
                (false, _) => Confirmation::NotRequested,
                (true, 0) => Confirmation::Unroutable,
                (true, _) => Confirmation::Ack,
            };
            Ok(confirmed(confirmation))
        })
    }

    async fn consume(&self, request: &ConsumeRequest) -> Result<DeliveryStream, TransportError> {
        let channel = self.id;
        let receiver = self.broker.with_channel(channel, |state| {
            let tag = if request.consumer_tag.is_empty() {
                state.next_consumer_tag += 1;
                format!("amq.ctag-{}", state.next_consumer_tag)
            } else {
                request.consumer_tag.clone()
            };

            let queue = state.queues.get_mut(&request.queue).ok_or_else(|| {
                TransportError::Protocol(format!("NOT_FOUND - no queue '{}'", request.queue))
            })?;
            if queue.consumers.iter().any(|c| c.exclusive)
                || (request.exclusive && !queue.consumers.is_empty())
            {
                return Err(TransportError::Protocol(format!(
                    "ACCESS_REFUSED - queue '{}' in exclusive use",
                    request.queue
                )));
            }
            if queue.consumers.iter().any(|c| c.tag == tag && c.channel == channel) {
                return Err(TransportError::Protocol(format!(
                    "NOT_ALLOWED - reused consumer tag '{tag}'"
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            queue.consumers.push(MemConsumer {
                tag,
                channel,
                prefetch: request.prefetch,
                exclusive: request.exclusive,
                in_flight: 0,
                deliveries: tx,
            });
            state.dispatch(&request.queue);
            Ok(rx)
        })?;

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let channel = self.id;
        self.broker.with_channel(channel, |state| {
            let name = state
                .queues
                .iter()
                .find(|(_, q)| {
                    q.consumers
                        .iter()
                        .any(|c| c.tag == consumer_tag && c.channel == channel)
                })
                .map(|(name, _)| name.clone());

            if let Some(name) = name {
                if let Some(queue) = state.queues.get_mut(&name) {
                    queue
                        .consumers
                        .retain(|c| !(c.tag == consumer_tag && c.channel == channel));
                }
                state.prune_auto_delete(&name);
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let channel = self.id;
        self.broker
            .with_channel(channel, |state| state.settle(channel, delivery_tag, None))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let channel = self.id;
        self.broker.with_channel(channel, |state| {
            state.settle(channel, delivery_tag, Some(requeue))
        })
    }

    async fn close(&self) {
        self.broker.lock().close_channel(self.id);
    }
}

/// Endpoint used by crate tests against the in-memory broker.
#[cfg(test)]
pub(crate) const MEMORY_ENDPOINT: &str = "amqp://memory";

/// A manager connected to `broker` with default settings.
#[cfg(test)]
pub(crate) async fn connected_manager(
    broker: &InMemoryBroker,
) -> Arc<crate::connection::ConnectionManager> {
    use crate::{
        config::BrokerConfig,
        connection::{ConnectionManager, ConnectionOptions},
        metrics::Metrics,
    };

    let cfg = BrokerConfig {
        endpoints: vec![MEMORY_ENDPOINT.to_owned()],
        ..BrokerConfig::default()
    };
    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        ConnectionOptions::from_config(&cfg),
        Arc::new(Metrics::new()),
    );
    manager.connect().await.expect("connected");
    manager
}
