// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Lifecycle
//!
//! `ConnectionManager` owns the single broker connection and the single channel opened on
//! it. Every other component reaches the channel through [`ConnectionManager::ensure_live`],
//! which connects on demand and returns a guard that serializes channel use.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (broker closes) Reconnecting -> Connected
//!                                    \                             |  ^
//!                                     \                            +--+ every reconnect delay
//!                                      +-> Closing -> Disconnected (shutdown, terminal)
//! ```
//!
//! A failed `initialize` is fatal and is not retried. After a broker-initiated closure a
//! supervisor task retries forever with a fixed delay until it succeeds or the manager is
//! shut down.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    topology::{self, Declaration},
    transport::{BrokerChannel, BrokerConnection, ConnectionEvent, Connector, EventSink},
};
use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Weak},
};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Lifecycle states of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

struct Session {
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
    declarations: Vec<Declaration>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

/// Owner of the broker connection and its channel.
pub struct ConnectionManager {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Exclusive access to the live channel.
///
/// Holding it keeps other callers and reconnects off the channel; drop it as soon
/// as the broker call returns.
pub struct LiveChannel<'a> {
    channel: Arc<dyn BrokerChannel>,
    session: MutexGuard<'a, Session>,
}

impl LiveChannel<'_> {
    /// Remembers a successful declaration so it can be replayed on a new connection.
    pub(crate) fn record(&mut self, declaration: Declaration) {
        if !self.session.declarations.contains(&declaration) {
            self.session.declarations.push(declaration);
        }
    }

    pub fn generation(&self) -> u64 {
        self.session.generation
    }
}

impl Deref for LiveChannel<'_> {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("shut_down", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a disconnected manager. The configuration is validated here and never
    /// changes afterwards.
    ///
    /// # Parameters
    /// * `config` - Broker URI and reconnect settings
    /// * `connector` - Transport used to open connections, usually `LapinConnector`
    ///
    /// # Returns
    /// The manager, or `AmqpError::InvalidConfig` for a malformed configuration
    pub fn new(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        config.validate()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Arc::new(ConnectionManager {
            config,
            connector,
            session: Mutex::new(Session {
                connection: None,
                channel: None,
                generation: 0,
                declarations: vec![],
                events: Some(events_rx),
            }),
            state,
            events,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Opens the connection and its channel.
    ///
    /// A failure here is fatal for the caller's startup: it is returned as is, the manager
    /// stays `Disconnected` and no retry is scheduled. Calling it while connected is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.shutdown_token.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }

        let mut session = self.session.lock().await;
        if self.is_live(&session) {
            debug!("broker connection already initialized");
            return Ok(());
        }

        let previous = self.state();
        self.set_state(ConnectionState::Connecting);
        match self.open_session(&mut session).await {
            Ok(()) => {
                self.start_supervisor(&mut session);
                self.set_state(ConnectionState::Connected);
                info!(
                    generation = session.generation,
                    "broker connection initialized successfully"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "failed to initialize broker connection"
                );
                self.connect_failed(previous, &session);
                Err(err)
            }
        }
    }

    /// Returns the live channel, connecting first when there is none.
    ///
    /// A channel that was closed underneath is never handed out: its connection is torn
    /// down and a fresh connection and channel are opened.
    pub async fn ensure_live(self: &Arc<Self>) -> Result<LiveChannel<'_>, AmqpError> {
        if self.shutdown_token.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }

        let mut session = self.session.lock().await;
        if self.shutdown_token.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }

        if !self.is_live(&session) {
            let previous = self.state();
            debug!(state = ?previous, "no live channel, connecting...");

            self.set_state(ConnectionState::Connecting);
            if let Err(err) = self.open_session(&mut session).await {
                error!(error = err.to_string(), "failure to connect to the broker");
                self.connect_failed(previous, &session);
                return Err(err);
            }
            self.start_supervisor(&mut session);
            self.set_state(ConnectionState::Connected);
        }

        match session.channel.clone() {
            Some(channel) => Ok(LiveChannel { channel, session }),
            None => Err(AmqpError::ChannelError("no channel available".to_owned())),
        }
    }

    /// Resolves once the manager is `Connected`, or fails when it is shut down.
    pub async fn wait_for_connected(&self) -> Result<(), AmqpError> {
        let mut state = self.state.subscribe();

        tokio::select! {
            biased;
            _ = self.shutdown_token.cancelled() => Err(AmqpError::ManagerClosed),
            changed = state.wait_for(|s| *s == ConnectionState::Connected) => {
                changed.map(|_| ()).map_err(|_| AmqpError::ManagerClosed)
            }
        }
    }

    /// Closes the channel, then the connection, and stops the reconnect loop.
    ///
    /// Close failures are logged and never stop the next step. Calling it while
    /// `Disconnected` with nothing open is a no-op, so a manager that never connected
    /// can still be initialized afterwards. Once a live or reconnecting manager has been
    /// shut down it refuses to connect again.
    pub async fn shutdown(&self) {
        // nothing is stored while Disconnected: failed attempts keep no handles
        if self.state() == ConnectionState::Disconnected {
            debug!("broker connection already disconnected");
            return;
        }

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.set_state(ConnectionState::Closing);

        {
            let mut session = self.session.lock().await;

            if let Some(channel) = session.channel.take() {
                if let Err(err) = channel.close().await {
                    error!(error = err.to_string(), "error during channel close");
                }
            }

            if let Some(connection) = session.connection.take() {
                if let Err(err) = connection.close().await {
                    error!(error = err.to_string(), "error during connection close");
                }
            }
        }

        self.task_tracker.wait().await;
        self.set_state(ConnectionState::Disconnected);
        info!("broker connection shut down");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    /// Settles the state after a failed connection attempt that started from `previous`.
    fn connect_failed(&self, previous: ConnectionState, session: &Session) {
        match previous {
            ConnectionState::Connected => {
                // the closure event of the lost connection is now stale, so the
                // supervisor is told about the failed replacement instead
                self.set_state(ConnectionState::Reconnecting);
                let _ = self.events.send(ConnectionEvent::Closed {
                    generation: session.generation,
                });
            }
            ConnectionState::Reconnecting => self.set_state(ConnectionState::Reconnecting),
            _ => self.set_state(ConnectionState::Disconnected),
        }
    }

    /// Whether the connection of `generation` is still the live one.
    pub(crate) async fn is_current(&self, generation: u64) -> bool {
        let session = self.session.lock().await;
        session.generation == generation && self.is_live(&session)
    }

    fn is_live(&self, session: &Session) -> bool {
        self.state() == ConnectionState::Connected
            && session.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// Replaces the session with a new connection and channel.
    ///
    /// Nothing is stored until the connection, the channel, and the topology replay
    /// all succeed.
    async fn open_session(&self, session: &mut Session) -> Result<(), AmqpError> {
        Self::discard(session).await;

        session.generation += 1;
        let generation = session.generation;

        let connection = self
            .connector
            .connect(&self.config, EventSink::new(generation, self.events.clone()))
            .await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = close_err.to_string(), "error closing half-open connection");
                }
                return Err(err);
            }
        };

        if self.config.restore_on_reconnect && !session.declarations.is_empty() {
            debug!(
                declarations = session.declarations.len(),
                "restoring topology on new connection"
            );
            if let Err(err) = topology::replay(channel.as_ref(), &session.declarations).await {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "error closing channel");
                }
                if let Err(close_err) = connection.close().await {
                    debug!(error = close_err.to_string(), "error closing connection");
                }
                return Err(err);
            }
        }

        session.connection = Some(connection);
        session.channel = Some(channel);

        Ok(())
    }

    /// Spawns the task watching connection events, once.
    fn start_supervisor(self: &Arc<Self>, session: &mut Session) {
        if let Some(events) = session.events.take() {
            self.task_tracker.spawn(Self::supervise(
                Arc::downgrade(self),
                events,
                self.shutdown_token.clone(),
            ));
        }
    }

    /// Drops whatever is left of the previous connection, closing it on a best-effort basis.
    async fn discard(session: &mut Session) {
        if let Some(channel) = session.channel.take() {
            if channel.is_open() {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "error closing stale channel");
                }
            }
        }

        if let Some(connection) = session.connection.take() {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "error closing stale connection");
            }
        }
    }

    /// Handles connection events until the manager is shut down or dropped.
    async fn supervise(
        manager: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ConnectionEvent::Error { generation, reason } => {
                    error!(generation, error = reason.as_str(), "broker connection error");
                }
                ConnectionEvent::Closed { generation } => {
                    let Some(this) = manager.upgrade() else {
                        break;
                    };
                    if !this.mark_closed(generation).await {
                        debug!(generation, "ignoring closure of a replaced connection");
                        continue;
                    }
                    drop(this);

                    warn!(
                        generation,
                        "broker connection closed, attempting to reconnect..."
                    );
                    Self::reconnect(&manager, &token).await;
                }
            }
        }

        debug!("connection supervisor stopped");
    }

    /// Moves to `Reconnecting` when `generation` is the current connection.
    async fn mark_closed(&self, generation: u64) -> bool {
        let mut session = self.session.lock().await;
        if self.shutdown_token.is_cancelled() || generation != session.generation {
            return false;
        }

        session.channel = None;
        session.connection = None;
        self.set_state(ConnectionState::Reconnecting);
        true
    }

    async fn reconnect(manager: &Weak<Self>, token: &CancellationToken) {
        loop {
            let Some(this) = manager.upgrade() else {
                return;
            };
            let delay = this.config.reconnect_delay_duration();

            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                attempt = this.reconnect_once() => attempt,
            };

            match attempt {
                Ok(()) => {
                    info!("successfully reconnected to the broker");
                    return;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to reconnect to the broker"
                    );
                }
            }
            drop(this);

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn reconnect_once(&self) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if self.shutdown_token.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }
        // a caller of ensure_live may have reconnected in the meantime
        if self.is_live(&session) {
            return Ok(());
        }

        self.set_state(ConnectionState::Reconnecting);
        match self.open_session(&mut session).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Reconnecting);
                Err(err)
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
