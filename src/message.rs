// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! [`OutboundMessage`] is what producers hand to the publisher, [`InboundMessage`]
//! is what handlers receive, and [`DeadLetterRecord`] describes a message the
//! retry coordinator gave up on. Envelope fields (id, type, timestamp, retry
//! count, origin) always travel in AMQP properties or headers so they survive
//! any payload format.

use crate::{
    connection::Connection,
    errors::{ConsumerError, HandlerError, PublishError},
    metrics::Metrics,
    transport::{MessageProperties, RawDelivery, WireMessage},
};
use chrono::{DateTime, Utc};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, warn};
use uuid::Uuid;

/// Content type of every payload produced by this crate
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Number of times the message has been redelivered for a retry
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// When the first copy of a retried message was enqueued (unix seconds)
pub const HEADER_FIRST_ENQUEUED_AT: &str = "x-first-enqueued-at";
/// Exchange the message was originally published to
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key the message was originally published with
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Queue the message was consumed from before it was dead-lettered
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
/// Why the message was dead-lettered
pub const HEADER_DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
/// When the message was dead-lettered (RFC 3339)
pub const HEADER_DEAD_LETTERED_AT: &str = "x-dead-lettered-at";

/// A header value representable in any broker's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

pub type Headers = BTreeMap<String, HeaderValue>;

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Text(v) => v.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

/// Domain event envelope produced by application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> Event<T> {
    pub fn new(kind: &str, payload: T) -> Self {
        Event {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_owned(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }
}

/// A message on its way to the broker. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage<T = serde_json::Value> {
    payload: T,
    exchange: String,
    routing_key: String,
    headers: Headers,
    message_id: String,
    correlation_id: Option<String>,
    kind: Option<String>,
    durable: bool,
    created_at: DateTime<Utc>,
}

impl<T: Serialize> OutboundMessage<T> {
    /// A durable message with a fresh id.
    pub fn new(exchange: &str, routing_key: &str, payload: T) -> Self {
        OutboundMessage {
            payload,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            headers: Headers::new(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            kind: None,
            durable: true,
            created_at: Utc::now(),
        }
    }

    /// Maps an [`Event`] envelope: id, type and timestamp go to the message
    /// properties, the event payload becomes the body.
    pub fn event(exchange: &str, routing_key: &str, event: Event<T>) -> Self {
        OutboundMessage {
            message_id: event.id,
            kind: Some(event.kind),
            created_at: event.timestamp,
            ..OutboundMessage::new(exchange, routing_key, event.payload)
        }
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = id.to_owned();
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Marks the message as non-persistent.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Falls back to the message id when no correlation id was set.
    pub fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.message_id)
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn to_wire(&self) -> Result<WireMessage, PublishError> {
        let body = serde_json::to_vec(&self.payload)
            .map_err(|err| PublishError::Serialization(err.to_string()))?;

        Ok(WireMessage {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body,
            properties: MessageProperties {
                message_id: Some(self.message_id.clone()),
                correlation_id: Some(self.correlation_id().to_owned()),
                kind: self.kind.clone(),
                content_type: Some(JSON_CONTENT_TYPE.to_owned()),
                timestamp: u64::try_from(self.created_at.timestamp()).ok(),
                persistent: self.durable,
                headers: self.headers.clone(),
            },
        })
    }
}

/// How a delivery left the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Processed successfully
    Ack,
    /// A retry copy was published; the original is acked
    Requeued,
    /// A dead-letter copy was published; the original is acked
    DeadLettered,
    /// Handler asked to discard; acked and logged
    Dropped,
    /// Handed back to the broker for redelivery
    BrokerRequeue,
    /// Rejected; the broker routes it to the queue's dead-letter exchange, if any
    BrokerReject,
}

#[derive(Clone)]
struct Acker {
    connection: Arc<Connection>,
    no_ack: bool,
    settled: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

/// A delivery handed to a [`MessageHandler`](crate::consumer::MessageHandler).
#[derive(Clone)]
pub struct InboundMessage {
    delivery: RawDelivery,
    queue: String,
    retry_count: u32,
    enqueued_at: Option<DateTime<Utc>>,
    context: Context,
    acker: Option<Acker>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("message_id", &self.delivery.properties.message_id)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl InboundMessage {
    /// Builds a detached message, not tied to any broker delivery. Settling it
    /// is a no-op; handy for exercising handlers directly.
    pub fn detached(queue: &str, delivery: RawDelivery) -> Self {
        let retry_count = retry_count_of(&delivery);
        let enqueued_at = enqueued_at_of(&delivery.properties);
        InboundMessage {
            delivery,
            queue: queue.to_owned(),
            retry_count,
            enqueued_at,
            context: Context::new(),
            acker: None,
        }
    }

    pub(crate) fn from_delivery(
        queue: &str,
        delivery: RawDelivery,
        connection: Arc<Connection>,
        no_ack: bool,
        context: Context,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut message = InboundMessage::detached(queue, delivery);
        message.context = context;
        message.acker = Some(Acker {
            connection,
            no_ack,
            settled: Arc::new(AtomicBool::new(false)),
            metrics,
        });
        message
    }

    pub fn payload(&self) -> &[u8] {
        &self.delivery.body
    }

    /// Deserializes the JSON payload. A payload that does not parse will never
    /// parse, so the error is non-retryable.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.delivery.body)
            .map_err(|err| HandlerError::non_retryable(format!("malformed payload: {err}")))
    }

    pub fn headers(&self) -> &Headers {
        &self.delivery.properties.headers
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.delivery.properties.headers.get(key)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.delivery.properties.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.delivery.properties.correlation_id.as_deref()
    }

    /// Event type, from the AMQP `type` property.
    pub fn kind(&self) -> Option<&str> {
        self.delivery.properties.kind.as_deref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Trace context propagated by the producer.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_settled(&self) -> bool {
        self.acker
            .as_ref()
            .map(|a| a.settled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Exchange and routing key the message was first published with,
    /// surviving retry republishes through the default exchange.
    pub fn original_route(&self) -> (String, String) {
        let exchange = self
            .header(HEADER_ORIGINAL_EXCHANGE)
            .and_then(HeaderValue::as_str)
            .unwrap_or(&self.delivery.exchange);
        let routing_key = self
            .header(HEADER_ORIGINAL_ROUTING_KEY)
            .and_then(HeaderValue::as_str)
            .unwrap_or(&self.delivery.routing_key);
        (exchange.to_owned(), routing_key.to_owned())
    }

    /// Confirms processing. Settling twice is a no-op.
    pub async fn ack(&self) -> Result<(), ConsumerError> {
        self.settle(Settlement::Ack).await
    }

    /// Copy republished to the source queue with the retry count bumped.
    pub(crate) fn retry_copy(&self) -> WireMessage {
        let (exchange, routing_key) = self.original_route();
        let mut properties = self.delivery.properties.clone();
        let headers = &mut properties.headers;

        headers.insert(
            HEADER_RETRY_COUNT.to_owned(),
            HeaderValue::from(self.retry_count.saturating_add(1)),
        );
        headers.insert(HEADER_ORIGINAL_EXCHANGE.to_owned(), HeaderValue::from(exchange));
        headers.insert(
            HEADER_ORIGINAL_ROUTING_KEY.to_owned(),
            HeaderValue::from(routing_key),
        );
        if let Some(at) = self.enqueued_at {
            headers
                .entry(HEADER_FIRST_ENQUEUED_AT.to_owned())
                .or_insert(HeaderValue::Int(at.timestamp()));
        }

        WireMessage {
            exchange: String::new(),
            routing_key: self.queue.clone(),
            body: self.delivery.body.clone(),
            properties,
        }
    }

    pub(crate) fn properties(&self) -> &MessageProperties {
        &self.delivery.properties
    }

    pub(crate) async fn settle(&self, settlement: Settlement) -> Result<(), ConsumerError> {
        let Some(acker) = &self.acker else {
            return Ok(());
        };

        if acker.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let tag = self.delivery.delivery_tag;
        if acker.no_ack
            && matches!(
                settlement,
                Settlement::BrokerRequeue | Settlement::BrokerReject
            )
        {
            // already acked on take, there is nothing to hand back
            error!(
                delivery_tag = tag,
                message_id = self.message_id().unwrap_or_default(),
                queue = self.queue(),
                "auto-acked message could be neither requeued nor dead-lettered, message lost"
            );
            // a failed dead-letter publish is already counted by the coordinator
            if settlement == Settlement::BrokerRequeue {
                acker.metrics.dead_letter_failed();
            }
            acker.metrics.delivery_released();
            return Ok(());
        }

        let result = if acker.no_ack {
            Ok(())
        } else {
            let channel = acker.connection.channel();
            match settlement {
                Settlement::BrokerRequeue => channel.nack(tag, true).await,
                Settlement::BrokerReject => channel.nack(tag, false).await,
                _ => channel.ack(tag).await,
            }
        };

        match result {
            Ok(()) => {
                acker.connection.touch();
                match settlement {
                    Settlement::Ack => acker.metrics.delivery_acked(),
                    Settlement::Requeued => acker.metrics.delivery_requeued(),
                    Settlement::Dropped => acker.metrics.delivery_dropped(),
                    Settlement::DeadLettered
                    | Settlement::BrokerRequeue
                    | Settlement::BrokerReject => acker.metrics.delivery_released(),
                }
                Ok(())
            }
            Err(err) => {
                // the broker requeues unacked deliveries of a lost channel
                warn!(
                    error = err.to_string(),
                    delivery_tag = tag,
                    message_id = self.message_id().unwrap_or_default(),
                    "failure to settle delivery, broker will redeliver"
                );
                acker.metrics.delivery_released();
                Err(ConsumerError::Settlement {
                    tag,
                    reason: err.to_string(),
                })
            }
        }
    }
}

fn retry_count_of(delivery: &RawDelivery) -> u32 {
    let header = delivery
        .properties
        .headers
        .get(HEADER_RETRY_COUNT)
        .and_then(HeaderValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    header.max(delivery.death_count)
}

fn enqueued_at_of(properties: &MessageProperties) -> Option<DateTime<Utc>> {
    let secs = properties
        .headers
        .get(HEADER_FIRST_ENQUEUED_AT)
        .and_then(HeaderValue::as_i64)
        .or_else(|| properties.timestamp.and_then(|t| i64::try_from(t).ok()))?;
    DateTime::from_timestamp(secs, 0)
}

/// A message the retry coordinator routed to a dead-letter destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterRecord {
    pub message_id: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub reason: String,
    pub original_exchange: String,
    pub original_routing_key: String,
    pub queue: String,
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub(crate) fn new(message: &InboundMessage, reason: &str) -> Self {
        let (original_exchange, original_routing_key) = message.original_route();
        DeadLetterRecord {
            message_id: message.message_id().map(str::to_owned),
            headers: message.headers().clone(),
            payload: message.payload().to_vec(),
            reason: reason.to_owned(),
            original_exchange,
            original_routing_key,
            queue: message.queue().to_owned(),
            retry_count: message.retry_count(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Original headers augmented with the diagnostic `x-*` fields.
    pub fn augmented_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        headers.insert(
            HEADER_ORIGINAL_EXCHANGE.to_owned(),
            HeaderValue::from(self.original_exchange.as_str()),
        );
        headers.insert(
            HEADER_ORIGINAL_ROUTING_KEY.to_owned(),
            HeaderValue::from(self.original_routing_key.as_str()),
        );
        headers.insert(
            HEADER_ORIGINAL_QUEUE.to_owned(),
            HeaderValue::from(self.queue.as_str()),
        );
        headers.insert(
            HEADER_DEAD_LETTER_REASON.to_owned(),
            HeaderValue::from(self.reason.as_str()),
        );
        headers.insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::from(self.retry_count));
        headers.insert(
            HEADER_DEAD_LETTERED_AT.to_owned(),
            HeaderValue::from(self.dead_lettered_at.to_rfc3339()),
        );
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn delivery(headers: Headers, death_count: u32) -> RawDelivery {
        RawDelivery {
            delivery_tag: 7,
            exchange: "jobs".to_owned(),
            routing_key: "jobs.completed".to_owned(),
            redelivered: false,
            body: br#"{"jobId":"j1"}"#.to_vec(),
            properties: MessageProperties {
                message_id: Some("m1".to_owned()),
                timestamp: Some(1_700_000_000),
                headers,
                ..MessageProperties::default()
            },
            death_count,
        }
    }

    #[test]
    fn event_envelope_maps_to_properties() {
        let event = Event::new("job.completed", json!({"jobId": "j1"})).with_id("m1");
        let timestamp = event.timestamp;
        let msg = OutboundMessage::event("jobs", "jobs.completed", event);
        let wire = msg.to_wire().expect("serializable");

        assert_eq!(wire.exchange, "jobs");
        assert_eq!(wire.routing_key, "jobs.completed");
        assert_eq!(wire.properties.message_id.as_deref(), Some("m1"));
        assert_eq!(wire.properties.correlation_id.as_deref(), Some("m1"));
        assert_eq!(wire.properties.kind.as_deref(), Some("job.completed"));
        assert_eq!(wire.properties.timestamp, Some(timestamp.timestamp() as u64));
        assert!(wire.properties.persistent);
        assert_eq!(wire.body, br#"{"jobId":"j1"}"#);
    }

    #[test]
    fn non_string_map_keys_fail_serialization() {
        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys are not valid JSON object keys");
        let msg = OutboundMessage::new("jobs", "k", payload);
        assert!(matches!(msg.to_wire(), Err(PublishError::Serialization(_))));
    }

    #[test]
    fn retry_count_takes_the_larger_source() {
        let mut headers = Headers::new();
        headers.insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::Int(2));
        assert_eq!(InboundMessage::detached("q", delivery(headers.clone(), 0)).retry_count(), 2);
        assert_eq!(InboundMessage::detached("q", delivery(headers, 5)).retry_count(), 5);
        assert_eq!(InboundMessage::detached("q", delivery(Headers::new(), 0)).retry_count(), 0);
    }

    #[test]
    fn retry_copy_targets_source_queue_and_keeps_origin() {
        let msg = InboundMessage::detached("notifications", delivery(Headers::new(), 0));
        let copy = msg.retry_copy();

        assert_eq!(copy.exchange, "");
        assert_eq!(copy.routing_key, "notifications");
        assert_eq!(copy.body, msg.payload());
        let h = &copy.properties.headers;
        assert_eq!(h.get(HEADER_RETRY_COUNT), Some(&HeaderValue::Int(1)));
        assert_eq!(h.get(HEADER_ORIGINAL_EXCHANGE), Some(&HeaderValue::from("jobs")));
        assert_eq!(
            h.get(HEADER_FIRST_ENQUEUED_AT),
            Some(&HeaderValue::Int(1_700_000_000))
        );

        let again = InboundMessage::detached(
            "notifications",
            RawDelivery {
                exchange: String::new(),
                routing_key: "notifications".to_owned(),
                properties: copy.properties,
                ..delivery(Headers::new(), 0)
            },
        );
        assert_eq!(again.retry_count(), 1);
        assert_eq!(
            again.original_route(),
            ("jobs".to_owned(), "jobs.completed".to_owned())
        );
    }

    #[test]
    fn decode_failure_is_non_retryable() {
        let mut d = delivery(Headers::new(), 0);
        d.body = b"not json".to_vec();
        let msg = InboundMessage::detached("q", d);
        let err = msg.decode::<serde_json::Value>().unwrap_err();
        assert_eq!(err.kind, crate::errors::HandlerErrorKind::NonRetryable);
    }

    #[test]
    fn dead_letter_headers_carry_diagnostics() {
        let msg = InboundMessage::detached("notifications", delivery(Headers::new(), 3));
        let record = DeadLetterRecord::new(&msg, "boom");
        let h = record.augmented_headers();

        assert_eq!(record.retry_count, 3);
        assert_eq!(h.get(HEADER_DEAD_LETTER_REASON), Some(&HeaderValue::from("boom")));
        assert_eq!(h.get(HEADER_RETRY_COUNT), Some(&HeaderValue::Int(3)));
        assert_eq!(h.get(HEADER_ORIGINAL_QUEUE), Some(&HeaderValue::from("notifications")));
        assert_eq!(
            h.get(HEADER_ORIGINAL_ROUTING_KEY),
            Some(&HeaderValue::from("jobs.completed"))
        );
        assert!(h.contains_key(HEADER_DEAD_LETTERED_AT));
    }

    #[tokio::test]
    async fn detached_messages_settle_as_noop() {
        let msg = InboundMessage::detached("q", delivery(Headers::new(), 0));
        assert!(msg.ack().await.is_ok());
        assert!(!msg.is_settled());
    }
}
