// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Messaging Client
//!
//! Each component owns one error enum so callers can tell at a glance whether a
//! failure was absorbed and retried internally (and then exhausted), or is fatal
//! and will never succeed on retry. `AmqpError` is the umbrella type returned by
//! the [`Messaging`](crate::context::Messaging) context.

use thiserror::Error;

/// Protocol-level failure reported by a [`Transport`](crate::transport::Transport)
/// or [`BrokerChannel`](crate::transport::BrokerChannel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint could not be reached (refused, DNS, TCP reset...)
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The broker refused our credentials or vhost access
    #[error("authentication refused: {0}")]
    AuthFailed(String),

    /// The channel or connection is no longer open
    #[error("channel closed")]
    Closed,

    /// A declaration conflicts with an existing resource
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Any other protocol error returned by the broker
    #[error("broker error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            TransportError::AuthFailed(_) | TransportError::PreconditionFailed(_)
        )
    }
}

/// Errors surfaced by the [`ConnectionManager`](crate::connection::ConnectionManager).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every endpoint failed within the configured attempt budget
    #[error("no broker endpoint reachable: {0}")]
    Unreachable(String),

    /// Authentication failed; never retried
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The reconnect budget is spent and the manager gave up
    #[error("reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// `ensure_connected` did not observe a live connection in time
    #[error("timed out waiting for a connection")]
    Timeout,

    /// The manager is closing or closed
    #[error("connection manager is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the [`ChannelTopology`](crate::topology::ChannelTopology).
///
/// None of these are retried automatically: a rejected declaration is a
/// configuration mismatch that needs an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The broker already holds a resource with different properties
    #[error("declaration of `{name}` conflicts with the existing resource: {reason}")]
    Conflict { name: String, reason: String },

    /// The broker rejected the declaration for another reason
    #[error("declaration of `{name}` rejected: {reason}")]
    Rejected { name: String, reason: String },

    /// No connection was available to declare against
    #[error("topology could not be declared: {0}")]
    Unavailable(#[from] ConnectionError),
}

/// Errors surfaced by the [`Publisher`](crate::publisher::Publisher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The payload could not be serialized; never retried
    #[error("failure to serialize payload: {0}")]
    Serialization(String),

    /// The broker did not confirm within the confirm timeout
    #[error("publish confirm timed out")]
    Timeout,

    /// The broker negatively confirmed the message
    #[error("broker rejected the message")]
    Nacked,

    /// No queue is bound to receive the message; never retried
    #[error("no queue bound for exchange `{exchange}` with routing key `{routing_key}`")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// The channel write failed
    #[error("failure to send message: {0}")]
    Send(String),

    /// Every attempt failed
    #[error("publish failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    /// The publisher no longer accepts messages
    #[error("publisher is shutting down")]
    ShuttingDown,

    /// A fatal connection failure (authentication, exhausted reconnects)
    #[error("connection failure: {0}")]
    Connection(ConnectionError),
}

/// Errors surfaced by the [`Consumer`](crate::consumer::Consumer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The broker refused the subscription
    #[error("failure to subscribe to `{queue}`: {reason}")]
    Subscribe { queue: String, reason: String },

    /// No registration with this consumer tag is active
    #[error("unknown consumer `{0}`")]
    UnknownRegistration(String),

    /// Acknowledging or rejecting a delivery failed
    #[error("failure to settle delivery {tag}: {reason}")]
    Settlement { tag: u64, reason: String },

    /// The consumer no longer accepts subscriptions
    #[error("consumer is shutting down")]
    ShuttingDown,

    #[error("connection failure: {0}")]
    Connection(#[from] ConnectionError),
}

/// How the retry coordinator should treat a [`HandlerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// Transient failure; retried until the retry budget is spent
    Retryable,
    /// The message can never be processed; dead-lettered immediately
    NonRetryable,
    /// The handler asks for the message to be dropped
    Discard,
}

/// Failure returned by application message handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} handler failure: {reason}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub reason: String,
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Retryable,
            reason: reason.into(),
        }
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::NonRetryable,
            reason: reason.into(),
        }
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Discard,
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading [`BrokerConfig`](crate::config::BrokerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failure to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error returned by the messaging context.
#[derive(Error, Debug)]
pub enum AmqpError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_precondition_are_not_transient() {
        assert!(!TransportError::AuthFailed("403".into()).is_transient());
        assert!(!TransportError::PreconditionFailed("406".into()).is_transient());
        assert!(TransportError::Closed.is_transient());
        assert!(TransportError::Unreachable("refused".into()).is_transient());
    }

    #[test]
    fn handler_error_constructors_set_kind() {
        assert_eq!(
            HandlerError::non_retryable("bad json").kind,
            HandlerErrorKind::NonRetryable
        );
        assert_eq!(HandlerError::discard("dup").kind, HandlerErrorKind::Discard);
        assert_eq!(
            HandlerError::retryable("db down").to_string(),
            "Retryable handler failure: db down"
        );
    }
}
