// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Type Dispatcher
//!
//! A [`MessageHandler`] that routes each delivery to the handler registered for
//! its event type (the AMQP `type` property). It lets one queue carry several
//! event types, each with its own handler.
//!
//! Messages of a type nobody registered for are removed from the queue with a
//! [`Discard`](crate::errors::HandlerErrorKind::Discard) failure, unless a
//! fallback handler is set.

use crate::{consumer::MessageHandler, errors::HandlerError, message::InboundMessage};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[derive(Clone, Default)]
pub struct TypeDispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl TypeDispatcher {
    pub fn new() -> Self {
        TypeDispatcher::default()
    }

    /// Registers `handler` for messages whose type is `kind`. A later
    /// registration for the same type replaces the earlier one.
    pub fn register(mut self, kind: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind.to_owned(), handler);
        self
    }

    /// Handler for messages of unregistered or missing type.
    pub fn fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl MessageHandler for TypeDispatcher {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let kind = message.kind().unwrap_or_default();

        match self.handlers.get(kind).or(self.fallback.as_ref()) {
            Some(handler) => handler.handle(message).await,
            None => {
                debug!(
                    kind,
                    message_id = message.message_id().unwrap_or_default(),
                    "removing message from queue - reason: unsupported msg type"
                );
                Err(HandlerError::discard(format!("unsupported message type `{kind}`")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::MockMessageHandler,
        errors::HandlerErrorKind,
        transport::{MessageProperties, RawDelivery},
    };

    fn message(kind: Option<&str>) -> InboundMessage {
        InboundMessage::detached(
            "notifications",
            RawDelivery {
                delivery_tag: 1,
                exchange: "jobs".to_owned(),
                routing_key: "jobs.completed".to_owned(),
                redelivered: false,
                body: b"{}".to_vec(),
                properties: MessageProperties {
                    kind: kind.map(str::to_owned),
                    ..MessageProperties::default()
                },
                death_count: 0,
            },
        )
    }

    fn handler(times: usize) -> Arc<dyn MessageHandler> {
        let mut mock = MockMessageHandler::new();
        mock.expect_handle().times(times).returning(|_| Ok(()));
        Arc::new(mock)
    }

    #[tokio::test]
    async fn routes_by_message_type() {
        let dispatcher = TypeDispatcher::new()
            .register("job.completed", handler(1))
            .register("job.failed", handler(0));

        assert!(dispatcher.handle(&message(Some("job.completed"))).await.is_ok());
        assert_eq!(dispatcher.kinds().len(), 2);
    }

    #[tokio::test]
    async fn unknown_types_are_discarded() {
        let dispatcher = TypeDispatcher::new().register("job.completed", handler(0));

        let err = dispatcher
            .handle(&message(Some("job.archived")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Discard);

        let err = dispatcher.handle(&message(None)).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Discard);
    }

    #[tokio::test]
    async fn fallback_takes_unregistered_types() {
        let dispatcher = TypeDispatcher::new()
            .register("job.completed", handler(0))
            .fallback(handler(1));

        assert!(dispatcher.handle(&message(Some("job.archived"))).await.is_ok());
    }
}
