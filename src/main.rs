// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! `amqp-relay`: declares the job-events topology, logs every job
//! notification it receives and keeps running until ctrl-c.
//!
//! Usage: `amqp-relay [config-file]`. Settings can also come from
//! `AMQP_RELAY__*` environment variables.

use amqp_relay::{
    channel::AmqpTransport,
    config::BrokerConfig,
    consumer::MessageHandler,
    context::Messaging,
    dispatcher::TypeDispatcher,
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    message::InboundMessage,
    queue::{QueueBinding, QueueDefinition},
    telemetry,
    topology::Topology,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

const JOBS_EXCHANGE: &str = "jobs";
const NOTIFICATIONS_QUEUE: &str = "notifications";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobEvent {
    job_id: String,
}

/// Logs job lifecycle events.
struct NotificationHandler;

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let event: JobEvent = message.decode()?;
        info!(
            job_id = event.job_id,
            kind = message.kind().unwrap_or_default(),
            message_id = message.message_id().unwrap_or_default(),
            retry_count = message.retry_count(),
            "job notification"
        );
        Ok(())
    }
}

fn job_topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new(JOBS_EXCHANGE).topic().durable())
        .queue(QueueDefinition::new(NOTIFICATIONS_QUEUE).durable().with_dlq())
        .queue_binding(
            QueueBinding::new(NOTIFICATIONS_QUEUE)
                .exchange(JOBS_EXCHANGE)
                .routing_key("jobs.*"),
        )
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    telemetry::init("info");

    let path = std::env::args().nth(1);
    let config = BrokerConfig::load(path.as_deref())?;

    let messaging = Messaging::start(&config, AmqpTransport::new()).await?;
    messaging.declare(&job_topology()).await?;

    let handler = Arc::new(NotificationHandler);
    let dispatcher = TypeDispatcher::new()
        .register("job.completed", handler.clone())
        .register("job.failed", handler.clone())
        .fallback(handler);
    messaging
        .subscribe(NOTIFICATIONS_QUEUE, Arc::new(dispatcher))
        .await?;

    let reporter = messaging.spawn_metrics_reporter();
    info!(queue = NOTIFICATIONS_QUEUE, "relay running, press ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for ctrl-c");
    }

    messaging.shutdown().await;
    reporter.abort();
    Ok(())
}
