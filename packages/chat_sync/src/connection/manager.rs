//! ConnectionManager: the one shared push channel for the whole client.
//!
//! Runs as an actor. Callers hold a [`ConnectionHandle`]; the manager task owns
//! the transport, the backoff counter and the single pending reconnect timer.
//! Which conversation is on screen is irrelevant here: the endpoint is fixed
//! and session filtering happens downstream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::protocol::StreamEvent;

use super::backoff::Backoff;
use super::state::{ConnectionState, ConnectionStatus};
use super::transport::{Transport, TransportSignal};

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fixed push endpoint, e.g. `http://127.0.0.1:3000/api/events`.
    pub endpoint: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Capacity of the event broadcast and of each transport signal channel.
    pub event_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            backoff_base: super::backoff::DEFAULT_BASE_DELAY,
            backoff_max: super::backoff::DEFAULT_MAX_DELAY,
            event_capacity: 256,
        }
    }
}

/// Commands accepted by the manager task.
#[derive(Debug)]
enum ConnectionCommand {
    Connect,
    Disconnect { respond_to: oneshot::Sender<()> },
    Reconnect,
    Shutdown,
}

/// Handle to the connection manager actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionCommand>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<StreamEvent>,
}

impl ConnectionHandle {
    /// Open the channel. A no-op while already connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        self.send(ConnectionCommand::Connect).await
    }

    /// Close the channel and cancel any pending reconnect. Safe to repeat.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::Disconnect { respond_to: tx })
            .await?;
        rx.await
            .map_err(|_| SyncError::ActorGone("connection manager"))
    }

    /// Tear down and connect again immediately, bypassing backoff.
    pub async fn reconnect(&self) -> Result<()> {
        self.send(ConnectionCommand::Reconnect).await
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ConnectionCommand::Shutdown).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Every parsed event, lifecycle signals included, in delivery order.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: ConnectionCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SyncError::ActorGone("connection manager"))
    }
}

/// A live transport: its signal channel plus the token that tears it down.
struct ActiveConnection {
    signals: mpsc::Receiver<TransportSignal>,
    cancel: CancellationToken,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    status_tx: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<StreamEvent>,
    receiver: mpsc::Receiver<ConnectionCommand>,
    active: Option<ActiveConnection>,
    /// Deadline of the single pending reconnect timer.
    reconnect_at: Option<Instant>,
}

impl ConnectionManager {
    /// Spawn the manager task. It starts idle; call
    /// [`ConnectionHandle::connect`] to open the channel.
    pub fn spawn(config: ConnectionConfig, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let (sender, receiver) = mpsc::channel(32);
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let manager = ConnectionManager {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            config,
            transport,
            status_tx,
            events: events.clone(),
            receiver,
            active: None,
            reconnect_at: None,
        };
        tokio::spawn(manager.run());

        ConnectionHandle {
            sender,
            status,
            events,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(ConnectionCommand::Connect) => self.connect(),
                        Some(ConnectionCommand::Disconnect { respond_to }) => {
                            self.disconnect();
                            let _ = respond_to.send(());
                        }
                        Some(ConnectionCommand::Reconnect) => self.reconnect(),
                        Some(ConnectionCommand::Shutdown) | None => break,
                    }
                }
                signal = next_signal(&mut self.active) => {
                    self.handle_signal(signal);
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.backoff.record_attempt();
                    info!(attempt = self.backoff.attempts(), "reconnect timer fired");
                    self.connect();
                }
            }
        }

        self.disconnect();
        debug!("connection manager shut down");
    }

    fn connect(&mut self) {
        if self.active.is_some() && self.status_tx.borrow().state.is_live() {
            debug!("connect ignored, channel already live");
            return;
        }

        self.teardown();
        self.reconnect_at = None;
        self.update(|s| {
            s.state = ConnectionState::Connecting;
            s.next_reconnect_in = None;
        });

        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        match self.transport.connect(&self.config.endpoint, tx) {
            Ok(drive) => {
                let cancel = CancellationToken::new();
                let task_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = task_cancel.cancelled() => {}
                        _ = drive => {}
                    }
                });
                debug!(endpoint = %self.config.endpoint, "connecting");
                self.active = Some(ActiveConnection {
                    signals: rx,
                    cancel,
                });
            }
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "failed to open push channel");
                self.update(|s| {
                    s.state = ConnectionState::Error;
                    s.last_error = Some(e.to_string());
                });
                self.schedule_reconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.teardown();
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.next_reconnect_in = None;
        });
    }

    fn reconnect(&mut self) {
        info!("manual reconnect");
        self.disconnect();
        self.backoff.reset();
        self.update(|s| s.reconnect_attempts = 0);
        self.connect();
    }

    /// Arm the single reconnect timer, replacing any pending one.
    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.delay();
        self.reconnect_at = Some(Instant::now() + delay);
        let attempts = self.backoff.attempts();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "scheduling reconnect"
        );
        self.update(|s| {
            s.reconnect_attempts = attempts;
            s.next_reconnect_in = Some(delay);
        });
    }

    fn teardown(&mut self) {
        if self.active.take().is_some() {
            debug!("closed previous transport");
        }
    }

    fn handle_signal(&mut self, signal: Option<TransportSignal>) {
        match signal {
            Some(TransportSignal::Open) => {
                self.backoff.reset();
                if self.status_tx.borrow().state != ConnectionState::Connected {
                    info!(endpoint = %self.config.endpoint, "push channel connected");
                }
                self.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.reconnect_attempts = 0;
                    s.next_reconnect_in = None;
                });
            }
            Some(TransportSignal::Frame(frame)) => {
                if let Some(event) = StreamEvent::from_frame(&frame) {
                    self.handle_event(event);
                }
            }
            Some(TransportSignal::Error(reason)) => {
                debug!(reason = %reason, "transient transport error, transport retrying");
            }
            Some(TransportSignal::Closed(reason)) => self.on_closed(reason),
            None => self.on_closed(None),
        }
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match &event {
            StreamEvent::Connected => {
                if self.status_tx.borrow().state != ConnectionState::Connected {
                    self.update(|s| s.state = ConnectionState::Connected);
                }
            }
            StreamEvent::Disconnected(e) => {
                info!(reason = ?e.reason, "server announced disconnect");
                self.update(|s| s.state = ConnectionState::Disconnected);
            }
            StreamEvent::Heartbeat => {
                self.update(|s| s.last_heartbeat_at = Some(Utc::now()));
            }
            _ => {}
        }
        // No receivers is fine; nobody may be listening yet.
        let _ = self.events.send(event);
    }

    fn on_closed(&mut self, reason: Option<String>) {
        self.active = None;
        let reason = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(reason = %reason, "push channel closed");
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(reason);
        });
        self.schedule_reconnect();
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status_tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }
}

async fn next_signal(active: &mut Option<ActiveConnection>) -> Option<TransportSignal> {
    match active {
        Some(connection) => connection.signals.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
