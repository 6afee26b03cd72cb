// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Context
//!
//! [`Messaging`] owns the one process-wide set of messaging components: the
//! connection manager, topology, publisher, retry coordinator and consumer. It
//! is constructed once at startup and passed by reference to whatever needs it.

use crate::{
    config::{BrokerConfig, DeadLetterConfig},
    connection::{ConnectionManager, ConnectionOptions, ConnectionState},
    consumer::{Consumer, ConsumerOptions, ConsumerRegistration, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    metrics::{Metrics, MetricsSnapshot},
    publisher::{PublishOptions, Publisher},
    queue::{QueueBinding, QueueDefinition},
    retry::{DeadLetterDestination, DeadLetterRoutes, RetryCoordinator, RetryPolicy},
    topology::{ChannelTopology, Topology},
    transport::Transport,
};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{error, info};

/// Durable queue (and, for a named exchange, a durable direct exchange and
/// binding) receiving dead-letters of queues without their own DLQ.
fn dead_letter_topology(cfg: &DeadLetterConfig) -> Topology {
    let queue = QueueDefinition::new(&cfg.routing_key).durable();
    if cfg.exchange.is_empty() {
        return Topology::new().queue(queue);
    }

    Topology::new()
        .exchange(ExchangeDefinition::new(&cfg.exchange).direct().durable())
        .queue(queue)
        .queue_binding(
            QueueBinding::new(&cfg.routing_key)
                .exchange(&cfg.exchange)
                .routing_key(&cfg.routing_key),
        )
}

pub struct Messaging {
    config: BrokerConfig,
    manager: Arc<ConnectionManager>,
    topology: Arc<ChannelTopology>,
    publisher: Arc<Publisher>,
    coordinator: Arc<RetryCoordinator>,
    consumer: Arc<Consumer>,
    metrics: Arc<Metrics>,
}

impl Messaging {
    /// Builds every component from `config`, connects and declares the
    /// fallback dead-letter destination.
    pub async fn start(
        config: &BrokerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Messaging, AmqpError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let manager = ConnectionManager::new(
            transport,
            ConnectionOptions::from_config(config),
            metrics.clone(),
        );
        let routes = Arc::new(DeadLetterRoutes::new(DeadLetterDestination::from_config(
            &config.dead_letter,
        )));
        let topology = ChannelTopology::new(manager.clone(), routes.clone());
        let publisher = Publisher::new(manager.clone(), PublishOptions::from_config(&config.publish));
        let coordinator = RetryCoordinator::new(
            RetryPolicy::from_config(&config.retry),
            publisher.clone(),
            routes,
        );
        let consumer = Consumer::new(
            manager.clone(),
            coordinator.clone(),
            ConsumerOptions::from_config(config),
        );

        let conn = manager.connect().await?;
        if let Err(err) = topology
            .declare(&dead_letter_topology(&config.dead_letter))
            .await
        {
            error!(
                error = err.to_string(),
                exchange = config.dead_letter.exchange,
                routing_key = config.dead_letter.routing_key,
                "failure to declare the dead-letter destination"
            );
            manager.shutdown().await;
            return Err(err.into());
        }
        info!(
            endpoint = conn.endpoint(),
            connection_name = config.connection_name,
            "messaging started"
        );

        Ok(Messaging {
            config: config.clone(),
            manager,
            topology,
            publisher,
            coordinator,
            consumer,
            metrics,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn topology(&self) -> &Arc<ChannelTopology> {
        &self.topology
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Declares `topology`, keeping it declared across reconnects.
    pub async fn declare(&self, topology: &Topology) -> Result<(), AmqpError> {
        Ok(self.topology.declare(topology).await?)
    }

    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerRegistration, AmqpError> {
        Ok(self.consumer.subscribe(queue, handler).await?)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Logs a metrics snapshot every `metrics_report_secs` until the context
    /// shuts down.
    pub fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let manager = Arc::downgrade(&self.manager);
        let period = Duration::from_secs(self.config.metrics_report_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if manager.state() == ConnectionState::Closing {
                    return;
                }

                let s = metrics.snapshot();
                info!(
                    connected = s.connected,
                    degraded = s.degraded,
                    reconnect_attempts = s.reconnect_attempts,
                    publish_success = s.publish_success,
                    publish_failure = s.publish_failure,
                    consumer_count = s.consumer_count,
                    unacked = s.unacked,
                    requeued = s.requeued,
                    dead_lettered = s.dead_lettered,
                    dead_letter_failures = s.dead_letter_failures,
                    "messaging metrics"
                );
            }
        })
    }

    /// Stops consumers (waiting, bounded, for in-flight handlers), stops
    /// accepting publishes, then closes the connection.
    pub async fn shutdown(&self) {
        info!("shutting down messaging");
        self.consumer.shutdown().await;
        self.publisher.close();
        self.manager.shutdown().await;
        info!("messaging stopped");
    }
}
