// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! A [`Topology`] is a declarative list of exchanges, queues and the bindings
//! between them. [`ChannelTopology`] declares it against the current
//! connection and remembers every declared descriptor, replaying them on each
//! reconnect before the new connection is handed out. This keeps the client
//! resilient to broker restarts that wipe non-durable resources.
//!
//! Declarations run in a fixed order: exchanges, queues (dead-letter queues
//! ahead of the queue that references them), then queue bindings.

use crate::{
    connection::{Connection, ConnectionListener, ConnectionManager},
    errors::{ConnectionError, TopologyError, TransportError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    retry::{DeadLetterDestination, DeadLetterRoutes},
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Declarative description of the routing structure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.contains(&def) {
            self.queues.push(def);
        }
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queues_binding.is_empty()
    }
}

struct Declared {
    topology: Topology,
    generation: u64,
}

/// Declares topologies and keeps them declared across reconnects.
pub struct ChannelTopology {
    manager: Arc<ConnectionManager>,
    routes: Arc<DeadLetterRoutes>,
    declared: Mutex<Vec<Declared>>,
}

impl ChannelTopology {
    /// Creates the topology manager and registers it for reconnect events.
    pub fn new(
        manager: Arc<ConnectionManager>,
        routes: Arc<DeadLetterRoutes>,
    ) -> Arc<ChannelTopology> {
        let topology = Arc::new(ChannelTopology {
            manager: manager.clone(),
            routes,
            declared: Mutex::new(vec![]),
        });
        let listener: Arc<dyn ConnectionListener> = topology.clone();
        manager.subscribe(Arc::downgrade(&listener));
        topology
    }

    /// Idempotently declares `topology` on the current connection.
    ///
    /// A descriptor already declared on this connection is skipped. A broker
    /// rejection is returned as is and never retried.
    pub async fn declare(&self, topology: &Topology) -> Result<(), TopologyError> {
        let conn = self.manager.ensure_connected().await?;

        if self.is_declared(topology, conn.generation()) {
            debug!(
                generation = conn.generation(),
                "topology already declared on this connection"
            );
            return Ok(());
        }

        if let Err(err) = self.install(&conn, topology).await {
            self.manager.metrics().topology_error();
            return Err(err);
        }

        self.remember(topology, conn.generation());
        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.queues_binding.len(),
            "topology declared"
        );
        Ok(())
    }

    /// Descriptors replayed on every reconnect.
    pub fn declared(&self) -> Vec<Topology> {
        self.declared
            .lock()
            .map(|d| d.iter().map(|d| d.topology.clone()).collect())
            .unwrap_or_default()
    }

    fn is_declared(&self, topology: &Topology, generation: u64) -> bool {
        self.declared
            .lock()
            .map(|declared| {
                declared
                    .iter()
                    .any(|d| d.generation == generation && &d.topology == topology)
            })
            .unwrap_or(false)
    }

    fn remember(&self, topology: &Topology, generation: u64) {
        if let Ok(mut declared) = self.declared.lock() {
            match declared.iter_mut().find(|d| &d.topology == topology) {
                Some(entry) => entry.generation = generation,
                None => declared.push(Declared {
                    topology: topology.clone(),
                    generation,
                }),
            }
        }
    }

    async fn install(
        &self,
        conn: &Arc<Connection>,
        topology: &Topology,
    ) -> Result<(), TopologyError> {
        self.install_exchange(conn, topology).await?;
        self.install_queue(conn, topology).await?;
        self.binding_queues(conn, topology).await?;
        conn.touch();
        Ok(())
    }

    async fn install_exchange(
        &self,
        conn: &Arc<Connection>,
        topology: &Topology,
    ) -> Result<(), TopologyError> {
        for exch in &topology.exchanges {
            debug!("creating exchange: {}", exch.name);

            conn.channel()
                .declare_exchange(exch)
                .await
                .map_err(|err| declaration_error(&exch.name, err))?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(
        &self,
        conn: &Arc<Connection>,
        topology: &Topology,
    ) -> Result<(), TopologyError> {
        for def in &topology.queues {
            for declaration in def.declarations() {
                debug!("creating queue: {}", declaration.name);

                conn.channel()
                    .declare_queue(&declaration)
                    .await
                    .map_err(|err| declaration_error(&declaration.name, err))?;

                debug!("queue: {} was created", declaration.name);
            }

            if let Some(dlq) = def.dlq_name() {
                self.routes
                    .register(def.name(), DeadLetterDestination::queue(dlq));
            }
        }

        Ok(())
    }

    async fn binding_queues(
        &self,
        conn: &Arc<Connection>,
        topology: &Topology,
    ) -> Result<(), TopologyError> {
        for binding in &topology.queues_binding {
            conn.channel()
                .bind_queue(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                )
                .await
                .map_err(|err| {
                    declaration_error(
                        &format!("{} -> {}", binding.exchange_name, binding.queue_name),
                        err,
                    )
                })?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

#[async_trait]
impl ConnectionListener for ChannelTopology {
    async fn on_reconnect(&self, connection: &Arc<Connection>) {
        for topology in self.declared() {
            match self.install(connection, &topology).await {
                Ok(()) => self.remember(&topology, connection.generation()),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        generation = connection.generation(),
                        "failure to redeclare topology after reconnect"
                    );
                    self.manager.metrics().topology_error();
                }
            }
        }
    }
}

fn declaration_error(name: &str, err: TransportError) -> TopologyError {
    error!(error = err.to_string(), name, "broker rejected declaration");

    match err {
        TransportError::PreconditionFailed(reason) => TopologyError::Conflict {
            name: name.to_owned(),
            reason,
        },
        TransportError::Closed => TopologyError::Unavailable(ConnectionError::Unreachable(
            "channel closed during declaration".to_owned(),
        )),
        TransportError::Unreachable(reason) => {
            TopologyError::Unavailable(ConnectionError::Unreachable(reason))
        }
        TransportError::AuthFailed(reason) | TransportError::Protocol(reason) => {
            TopologyError::Rejected {
                name: name.to_owned(),
                reason,
            }
        }
    }
}
