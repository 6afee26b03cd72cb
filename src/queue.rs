// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue and binding definitions, including the optional dead-letter queue
//! that rejected deliveries are routed to.

use crate::{
    message::{HeaderValue, Headers},
    transport::QueueDeclaration,
};

/// Argument naming the exchange rejected messages are re-published to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the routing key rejected messages are re-published with
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument setting the queue-wide message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument bounding the number of ready messages
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument bounding the total size of ready messages
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue, built with chained setters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the dead-letter queue, when one is configured.
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Makes the queue and its dead-letter queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a `<name>-dlq` dead-letter queue.
    ///
    /// Messages the broker rejects (nack without requeue, TTL expiry, overflow)
    /// and messages the retry coordinator gives up on both land there.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Declarations to send, dead-letter queue first so the main queue's
    /// `x-dead-letter-*` arguments never point at a missing queue.
    pub(crate) fn declarations(&self) -> Vec<QueueDeclaration> {
        let mut declarations = Vec::with_capacity(2);
        let mut args = Headers::new();

        if let Some(dlq) = &self.dlq_name {
            declarations.push(QueueDeclaration {
                name: dlq.clone(),
                durable: self.durable,
                exclusive: self.exclusive,
                auto_delete: self.delete,
                arguments: Headers::new(),
            });
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(""),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(dlq.as_str()),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl.into()));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::Int(max.into()));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::Int(max_bytes.into()),
            );
        }

        declarations.push(QueueDeclaration {
            name: self.name.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            arguments: args,
        });

        declarations
    }
}

/// Binds a queue to an exchange under a routing key (or topic pattern).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_single_declaration() {
        let decls = QueueDefinition::new("orders").durable().declarations();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "orders");
        assert!(decls[0].durable);
        assert!(decls[0].arguments.is_empty());
    }

    #[test]
    fn dlq_is_declared_first_and_wired_through_default_exchange() {
        let def = QueueDefinition::new("notifications").durable().with_dlq();
        assert_eq!(def.dlq_name(), Some("notifications-dlq"));

        let decls = def.declarations();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].name, "notifications-dlq");
        assert!(decls[0].durable);

        let args = &decls[1].arguments;
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from(""))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("notifications-dlq"))
        );
    }

    #[test]
    fn limits_become_arguments() {
        let decls = QueueDefinition::new("q")
            .ttl(60_000)
            .max_length(100)
            .max_length_bytes(1024)
            .declarations();
        let args = &decls[0].arguments;
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::Int(60_000)));
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH), Some(&HeaderValue::Int(100)));
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH_BYTES), Some(&HeaderValue::Int(1024)));
    }

    #[test]
    fn binding_builder() {
        let b = QueueBinding::new("notifications")
            .exchange("jobs")
            .routing_key("jobs.*");
        assert_eq!(b.queue_name, "notifications");
        assert_eq!(b.exchange_name, "jobs");
        assert_eq!(b.routing_key, "jobs.*");
    }
}
