// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! lapin-backed implementation of [`Transport`] and [`BrokerChannel`]. Every
//! connect opens one connection with one long-lived channel for publishing and
//! consuming. Declarations run on a short-lived side channel so a rejected
//! declaration (which closes its channel in AMQP) never takes the main channel
//! down with it.

use crate::{
    errors::TransportError,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers},
    transport::{
        BrokerChannel, Confirmation, ConfirmFuture, ConnectSettings, ConsumeRequest,
        DeliveryStream, MessageProperties, QueueDeclaration, RawDelivery, Transport,
        WireMessage, PERSISTENT_DELIVERY_MODE,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{basic::AMQPProperties, AMQPErrorKind, AMQPHardError, AMQPSoftError},
    publisher_confirm,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Header RabbitMQ adds when it dead-letters a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside each `x-death` entry
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Connects to RabbitMQ with lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport)
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<bool>,
    signal: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        endpoint: &str,
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(settings.connection_name.clone()));

        let uri = with_heartbeat(endpoint, settings.heartbeat);
        let connection = Connection::connect(&uri, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            classify(&err)
        })?;
        debug!("amqp connected");

        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            classify(&err)
        })?;

        if settings.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to enable publisher confirms");
                    classify(&err)
                })?;
        }
        debug!("channel created");

        let (tx, closed) = watch::channel(false);
        let signal = Arc::new(tx);
        let on_error = signal.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            let _ = on_error.send(true);
        });
        let on_channel_error = signal.clone();
        channel.on_error(move |err| {
            error!(error = err.to_string(), "amqp channel error");
            let _ = on_channel_error.send(true);
        });

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            closed,
            signal,
        }))
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        debug!("creating exchange: {}", def.name);
        let side = self.side_channel().await?;

        let result = side
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&def.params),
            )
            .await;
        close_side_channel(side).await;

        result.map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            classify(&err)
        })
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), TransportError> {
        debug!("creating queue: {}", declaration.name);
        let side = self.side_channel().await?;

        let result = side
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&declaration.arguments),
            )
            .await;
        close_side_channel(side).await;

        result.map(|_| ()).map_err(|err| {
            error!(
                error = err.to_string(),
                name = declaration.name,
                "error to declare the queue"
            );
            classify(&err)
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );
        let side = self.side_channel().await?;

        let result = side
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await;
        close_side_channel(side).await;

        result.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            classify(&err)
        })
    }

    async fn publish(&self, message: &WireMessage) -> Result<ConfirmFuture, TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                classify(&err)
            })?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(publisher_confirm::Confirmation::Ack(Some(returned))) => {
                    warn!(
                        reply_code = returned.reply_code,
                        reply_text = returned.reply_text.as_str(),
                        "message returned as unroutable"
                    );
                    Ok(Confirmation::Unroutable)
                }
                Ok(publisher_confirm::Confirmation::Ack(None)) => Ok(Confirmation::Ack),
                Ok(publisher_confirm::Confirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(publisher_confirm::Confirmation::NotRequested) => {
                    Ok(Confirmation::NotRequested)
                }
                Err(err) => Err(classify(&err)),
            }
        }))
    }

    async fn consume(&self, request: &ConsumeRequest) -> Result<DeliveryStream, TransportError> {
        self.channel
            .basic_qos(request.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                classify(&err)
            })?;

        let consumer = self
            .channel
            .basic_consume(
                &request.queue,
                &request.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: request.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                classify(&err)
            })?;

        Ok(consumer
            .map(|result| result.map(raw_delivery).map_err(|err| classify(&err)))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| classify(&err))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                classify(&err)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                classify(&err)
            })
    }

    async fn close(&self) {
        let _ = self.signal.send(true);
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!(error = err.to_string(), "channel already closed");
        }
        if let Err(err) = self.connection.close(200, "closing").await {
            debug!(error = err.to_string(), "connection already closed");
        }
    }
}

impl AmqpChannel {
    async fn side_channel(&self) -> Result<Channel, TransportError> {
        self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            classify(&err)
        })
    }
}

async fn close_side_channel(channel: Channel) {
    if channel.status().connected() {
        if let Err(err) = channel.close(200, "declared").await {
            warn!(error = err.to_string(), "failure to close declaration channel");
        }
    }
}

/// Appends the heartbeat to the URI unless the caller already set one.
fn with_heartbeat(endpoint: &str, heartbeat: Duration) -> String {
    if endpoint.contains("heartbeat=") {
        return endpoint.to_owned();
    }
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}heartbeat={}", endpoint, separator, heartbeat.as_secs())
}

pub(crate) fn classify(err: &lapin::Error) -> TransportError {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => {
                TransportError::AuthFailed(amqp.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                TransportError::PreconditionFailed(amqp.to_string())
            }
            _ => TransportError::Protocol(amqp.to_string()),
        },
        lapin::Error::IOError(_) => TransportError::Unreachable(err.to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        _ => TransportError::Protocol(err.to_string()),
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Text(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        };
        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }
    FieldTable::from(btree)
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok().map(HeaderValue::Int),
        AMQPValue::ShortString(v) => Some(HeaderValue::Text(v.as_str().to_owned())),
        AMQPValue::LongString(v) => Some(HeaderValue::Text(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(field_table(&props.headers));

    if let Some(id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(kind) = &props.kind {
        properties = properties.with_kind(ShortString::from(kind.as_str()));
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(timestamp) = props.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if props.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    properties
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| header_value(v).map(|v| (k.as_str().to_owned(), v)))
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
        kind: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        timestamp: *props.timestamp(),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

/// Reads the broker's dead-letter count from the first `x-death` entry.
fn death_count(props: &AMQPProperties) -> u32 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let count = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(value) => match value.as_array() {
            Some(arr) => match arr.as_slice().first() {
                Some(value) => match value.as_field_table() {
                    Some(table) => match table.inner().get(AMQP_HEADERS_COUNT) {
                        Some(value) => value.as_long_long_int().unwrap_or_default(),
                        _ => 0,
                    },
                    _ => 0,
                },
                _ => 0,
            },
            _ => 0,
        },
        _ => 0,
    };

    u32::try_from(count).unwrap_or(0)
}

fn raw_delivery(delivery: Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        death_count: death_count(&delivery.properties),
        body: delivery.data,
    }
}
