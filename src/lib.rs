// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-relay
//!
//! A reliable AMQP messaging client: a supervised connection with reconnect
//! backoff, idempotent topology declaration replayed after reconnects,
//! confirmed publishing with retries, and consumers with bounded concurrency,
//! retry and dead-letter handling.
//!
//! Start from [`context::Messaging`], which builds and owns every component.

mod otel;

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod telemetry;
pub mod testing;
pub mod topology;
pub mod transport;
