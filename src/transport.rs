// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! Everything above this module talks to the broker through [`Transport`] and
//! [`BrokerChannel`]. [`AmqpTransport`](crate::channel::AmqpTransport) speaks
//! AMQP 0-9-1 through lapin; [`InMemoryBroker`](crate::testing::InMemoryBroker)
//! implements the same contract in memory for tests.

use crate::{errors::TransportError, exchange::ExchangeDefinition, message::Headers};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use std::{sync::Arc, time::Duration};

#[cfg(test)]
use mockall::automock;

/// Delivery mode flagging a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Outcome of a publisher confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Confirmed, but returned because no queue was bound to receive it
    Unroutable,
    /// Confirms are disabled on this channel
    NotRequested,
}

pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, TransportError>>;

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, TransportError>>;

/// Settings applied to every channel opened by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    pub connection_name: String,
    pub heartbeat: Duration,
    pub confirms: bool,
}

/// AMQP basic properties carried by every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub persistent: bool,
    pub headers: Headers,
}

/// A message ready to be written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A delivery as handed over by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Broker-side dead-letter cycles (`x-death[0].count`), if any
    pub death_count: u32,
}

/// A queue as sent to the broker, with its `x-*` arguments resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

/// A subscription as sent to the broker. Deliveries always need an explicit
/// ack, so `prefetch` bounds what the broker pushes to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub exclusive: bool,
}

/// Opens channels against a broker endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError>;
}

/// One open channel (and its underlying connection).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Resolves once the channel is no longer usable.
    async fn closed(&self);

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Writes the message and returns the pending broker confirmation.
    async fn publish(&self, message: &WireMessage) -> Result<ConfirmFuture, TransportError>;

    async fn consume(&self, request: &ConsumeRequest) -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self);
}
