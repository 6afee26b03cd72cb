// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] exclusively owns the broker connection. It walks
//! the endpoint list on connect, supervises the live connection (close signal
//! plus a heartbeat-interval liveness check), and reconnects with jittered
//! exponential backoff. Publisher, consumer and topology never hold a channel
//! of their own: they ask [`ConnectionManager::ensure_connected`] every time,
//! so a reconnect swaps the channel for all of them at once.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> Connecting ...
//!                                   \-> Closing -> Disconnected (terminal)
//! ```

use crate::{
    backoff::{BackoffPolicy, BackoffSchedule},
    config::BrokerConfig,
    errors::{ConnectionError, TransportError},
    metrics::Metrics,
    transport::{BrokerChannel, ConnectSettings, Transport},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

/// Lifecycle of the managed connection, broadcast on every transition.
///
/// - Disconnected: no usable connection; publishes and attaches wait
/// - Connecting: a connect or reconnect attempt is in progress
/// - Connected: a live connection with its topology restored
/// - Closing: shutdown started; nothing reconnects anymore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Connection manager settings, usually derived from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub endpoints: Vec<String>,
    pub settings: ConnectSettings,
    /// Rounds over the endpoint list for the first connect
    pub connect_attempts: u32,
    pub ensure_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// `None` reconnects forever
    pub max_reconnect_attempts: Option<u32>,
    /// Beyond this the manager reports degraded and keeps trying
    pub max_reconnect_wait: Duration,
}

impl ConnectionOptions {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        ConnectionOptions {
            endpoints: cfg.endpoints.clone(),
            settings: ConnectSettings {
                connection_name: cfg.connection_name.clone(),
                heartbeat: cfg.heartbeat(),
                confirms: cfg.publish.confirms,
            },
            connect_attempts: cfg.connect_attempts.max(1),
            ensure_timeout: cfg.ensure_timeout(),
            backoff: cfg.reconnect.policy(),
            max_reconnect_attempts: cfg.reconnect.max_attempts,
            max_reconnect_wait: cfg.reconnect.max_total_wait(),
        }
    }
}

/// A live session with the broker.
pub struct Connection {
    endpoint: String,
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    heartbeat: Duration,
    created_at: DateTime<Utc>,
    opened: Instant,
    last_activity: AtomicI64,
}

impl Connection {
    fn new(
        endpoint: &str,
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
        heartbeat: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Connection {
            endpoint: endpoint.to_owned(),
            generation,
            channel,
            heartbeat,
            created_at,
            opened: Instant::now(),
            last_activity: AtomicI64::new(created_at.timestamp_millis()),
        }
    }

    /// Broker endpoint this connection was opened against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Increments with every successful (re)connect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The channel carrying publishes, consumes and acks.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Heartbeat negotiated for this connection.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last successful confirm or settlement on this connection.
    ///
    /// # Returns
    /// * `DateTime<Utc>` - the last activity, or `created_at` before any
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    /// Whether both the connection and its channel are still usable.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub(crate) fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Component that must react to connection changes.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// The connection just transitioned to `Disconnected`.
    fn on_disconnect(&self, _reason: &str) {}

    /// A new connection is open but not yet published as `Connected`;
    /// state that must exist before traffic resumes is restored here.
    async fn on_reconnect(&self, _connection: &Arc<Connection>) {}
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    current: RwLock<Option<Arc<Connection>>>,
    failure: Mutex<Option<ConnectionError>>,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        metrics: Arc<Metrics>,
    ) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        Arc::new(ConnectionManager {
            transport,
            options,
            metrics,
            state,
            transitions,
            current: RwLock::new(None),
            failure: Mutex::new(None),
            listeners: Mutex::new(vec![]),
            generation: AtomicU64::new(0),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Every state transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Registers a listener. The manager keeps a weak reference only.
    pub fn subscribe(&self, listener: Weak<dyn ConnectionListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Opens the first reachable endpoint, in order, retrying the whole list
    /// up to `connect_attempts` times, and starts supervising it.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<Connection>, ConnectionError> {
        if *self.shutdown.borrow() {
            return Err(ConnectionError::ShuttingDown);
        }
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let mut schedule = self.options.backoff.schedule();
        let mut last_error = String::from("no endpoints configured");

        self.transition(ConnectionState::Connecting);
        for round in 0..self.options.connect_attempts {
            match self.open_any().await {
                Ok(conn) => {
                    self.install(conn.clone()).await;
                    self.spawn_supervisor(conn.clone(), schedule);
                    return Ok(conn);
                }
                Err(ConnectionError::AuthFailed(reason)) => {
                    error!(reason, "broker refused credentials");
                    self.transition(ConnectionState::Disconnected);
                    return Err(ConnectionError::AuthFailed(reason));
                }
                Err(err) => last_error = err.to_string(),
            }

            if round + 1 < self.options.connect_attempts {
                let delay = schedule.next_delay();
                warn!(
                    round,
                    delay_ms = delay.as_millis() as u64,
                    "no endpoint reachable, retrying"
                );
                if !self.sleep_unless_shutdown(delay).await {
                    return Err(ConnectionError::ShuttingDown);
                }
            }
        }

        error!(error = last_error, "failure to connect");
        self.transition(ConnectionState::Disconnected);
        Err(ConnectionError::Unreachable(last_error))
    }

    /// Returns the live connection, waiting (bounded) while a reconnect is
    /// in progress.
    pub async fn ensure_connected(&self) -> Result<Arc<Connection>, ConnectionError> {
        let mut state = self.state.subscribe();
        let wait = async {
            loop {
                if let Some(conn) = self.current() {
                    return Ok(conn);
                }
                if let Some(err) = self.terminal_failure() {
                    return Err(err);
                }
                if *state.borrow_and_update() == ConnectionState::Closing {
                    return Err(ConnectionError::ShuttingDown);
                }
                if state.changed().await.is_err() {
                    return Err(ConnectionError::ShuttingDown);
                }
            }
        };

        match time::timeout(self.options.ensure_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.options.ensure_timeout.as_millis() as u64,
                    "timed out waiting for a connection"
                );
                Err(ConnectionError::Timeout)
            }
        }
    }

    /// Reports a failed operation on `conn`. If it is still the current
    /// connection its channel is closed so the supervisor reconnects.
    pub async fn report_failure(&self, conn: &Arc<Connection>, reason: &str) {
        let is_current = self
            .current()
            .map(|c| c.generation == conn.generation)
            .unwrap_or(false);
        if is_current {
            warn!(reason, endpoint = conn.endpoint(), "dropping failed connection");
            conn.channel.close().await;
        }
    }

    /// Stops accepting work, closes the connection and leaves the manager in
    /// its terminal `Disconnected` state.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down connection manager");
        self.set_failure(ConnectionError::ShuttingDown);
        self.transition(ConnectionState::Closing);

        let supervisor = self.supervisor.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        if let Some(conn) = self.take_current() {
            conn.channel.close().await;
        }
        self.metrics.set_connected(false);
        self.transition(ConnectionState::Disconnected);
    }

    fn current(&self) -> Option<Arc<Connection>> {
        let guard = self.current.read().ok()?;
        guard.as_ref().filter(|c| c.is_open()).cloned()
    }

    fn take_current(&self) -> Option<Arc<Connection>> {
        self.current.write().ok().and_then(|mut c| c.take())
    }

    fn terminal_failure(&self) -> Option<ConnectionError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    fn set_failure(&self, err: ConnectionError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(err);
        }
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "connection state");
            *state = next;
            true
        });
        if changed {
            let _ = self.transitions.send(next);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.retain(|l| l.strong_count() > 0);
                listeners.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => vec![],
        }
    }

    async fn open_any(&self) -> Result<Arc<Connection>, ConnectionError> {
        let mut last_error = String::from("no endpoints configured");

        for endpoint in &self.options.endpoints {
            debug!(endpoint, "connecting");
            match self
                .transport
                .connect(endpoint, &self.options.settings)
                .await
            {
                Ok(channel) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(endpoint, generation, "connected");
                    return Ok(Arc::new(Connection::new(
                        endpoint,
                        generation,
                        channel,
                        self.options.settings.heartbeat,
                    )));
                }
                Err(TransportError::AuthFailed(reason)) => {
                    return Err(ConnectionError::AuthFailed(reason));
                }
                Err(err) => {
                    warn!(endpoint, error = err.to_string(), "endpoint unreachable");
                    last_error = err.to_string();
                }
            }
        }

        Err(ConnectionError::Unreachable(last_error))
    }

    /// Lets listeners restore state, then publishes the connection.
    async fn install(&self, conn: Arc<Connection>) {
        for listener in self.listeners() {
            listener.on_reconnect(&conn).await;
        }
        if let Ok(mut current) = self.current.write() {
            *current = Some(conn);
        }
        if let Ok(mut failure) = self.failure.lock() {
            failure.take();
        }
        self.metrics.set_connected(true);
        self.transition(ConnectionState::Connected);
    }

    fn spawn_supervisor(self: &Arc<Self>, conn: Arc<Connection>, schedule: BackoffSchedule) {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(supervise(manager, conn, schedule, shutdown));
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(previous) = supervisor.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = time::sleep(delay) => true,
            _ = shutdown.wait_for(|s| *s) => false,
        }
    }

    fn mark_disconnected(&self, conn: &Arc<Connection>, reason: &str) {
        warn!(reason, endpoint = conn.endpoint(), "connection lost");
        if let Ok(mut current) = self.current.write() {
            if current.as_ref().map(|c| c.generation) == Some(conn.generation) {
                current.take();
            }
        }
        self.metrics.set_connected(false);
        self.transition(ConnectionState::Disconnected);
        for listener in self.listeners() {
            listener.on_disconnect(reason);
        }
    }

    /// Reconnect loop. Gives up only on auth failure, an exhausted attempt
    /// budget, or shutdown.
    async fn reconnect(
        &self,
        schedule: &mut BackoffSchedule,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        self.transition(ConnectionState::Connecting);

        loop {
            if *self.shutdown.borrow() {
                return Err(ConnectionError::ShuttingDown);
            }

            attempts += 1;
            self.metrics.reconnect_attempt();

            match self.open_any().await {
                Ok(conn) => {
                    info!(attempts, "reconnected");
                    self.install(conn.clone()).await;
                    return Ok(conn);
                }
                Err(ConnectionError::AuthFailed(reason)) => {
                    error!(reason, "broker refused credentials, not reconnecting");
                    return Err(ConnectionError::AuthFailed(reason));
                }
                Err(err) => {
                    if let Some(max) = self.options.max_reconnect_attempts {
                        if attempts >= max {
                            error!(attempts, "reconnect attempts exhausted");
                            return Err(ConnectionError::ReconnectExhausted(attempts));
                        }
                    }

                    if started.elapsed() >= self.options.max_reconnect_wait
                        && !self.metrics.is_degraded()
                    {
                        error!(
                            waited_secs = started.elapsed().as_secs(),
                            "broker unavailable for too long, reporting degraded"
                        );
                        self.metrics.set_degraded();
                    }

                    let delay = schedule.next_delay();
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = err.to_string(),
                        "reconnect failed, backing off"
                    );
                    if !self.sleep_unless_shutdown(delay).await {
                        return Err(ConnectionError::ShuttingDown);
                    }
                }
            }
        }
    }
}

/// Waits for the connection to die, then reconnects; repeats until shutdown
/// or a terminal failure.
async fn supervise(
    manager: Weak<ConnectionManager>,
    mut conn: Arc<Connection>,
    mut schedule: BackoffSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let heartbeat = conn.heartbeat().max(Duration::from_millis(100));
        let reason = {
            let mut liveness = time::interval(heartbeat);
            liveness.tick().await;
            loop {
                tokio::select! {
                    _ = conn.channel().closed() => break "channel closed",
                    _ = liveness.tick() => {
                        if !conn.is_open() {
                            break "heartbeat check failed";
                        }
                    }
                    _ = shutdown.wait_for(|s| *s) => return,
                }
            }
        };

        let Some(mgr) = manager.upgrade() else {
            return;
        };
        if *mgr.shutdown.borrow() {
            return;
        }

        // a connection that held for a heartbeat earns a fresh backoff
        if conn.opened.elapsed() > conn.heartbeat() {
            schedule.reset();
        }

        mgr.mark_disconnected(&conn, reason);
        match mgr.reconnect(&mut schedule).await {
            Ok(next) => conn = next,
            Err(ConnectionError::ShuttingDown) => return,
            Err(err) => {
                error!(error = err.to_string(), "connection manager gave up");
                mgr.set_failure(err);
                mgr.transition(ConnectionState::Disconnected);
                return;
            }
        }
    }
}
