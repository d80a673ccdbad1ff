//! SyncEngine: wires the push channel, the streaming store and history
//! reconciliation together.
//!
//! One task owns all session state. It handles, one at a time: push events,
//! the poll and grace deadlines, completed history fetches and handle
//! commands. Fetches run in their own tasks and report back over a channel,
//! so a slow history endpoint never holds up event ingestion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, SseTransport,
    Transport, wait_until,
};
use crate::error::{Result, SyncError};
use crate::history::{HistorySource, HttpHistorySource};
use crate::protocol::StreamEvent;
use crate::reconciler;
use crate::store::{StreamingRun, StreamingStore};
use crate::types::Message;

/// Merged message list for a session, published whenever it may have changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewUpdate {
    pub session_key: String,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
enum EngineCommand {
    StreamingState {
        session_key: String,
        respond_to: oneshot::Sender<Option<StreamingRun>>,
    },
    RealtimeBuffer {
        session_key: String,
        respond_to: oneshot::Sender<Vec<Message>>,
    },
    RunError {
        session_key: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    MergedMessages {
        session_key: String,
        persisted: Vec<Message>,
        respond_to: oneshot::Sender<Vec<Message>>,
    },
    SetActiveSession {
        session_key: Option<String>,
        respond_to: oneshot::Sender<()>,
    },
    Refresh,
    ClearSession {
        session_key: String,
        respond_to: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to the sync engine. Cheap to clone; all clones address one engine.
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<EngineCommand>,
    connection: ConnectionHandle,
    views: broadcast::Sender<ViewUpdate>,
}

impl SyncHandle {
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Most recent terminal connection error.
    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Raw parsed events, for diagnostics.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.connection.subscribe()
    }

    pub fn subscribe_views(&self) -> broadcast::Receiver<ViewUpdate> {
        self.views.subscribe()
    }

    pub async fn streaming_state(&self, session_key: &str) -> Result<Option<StreamingRun>> {
        let session_key = session_key.to_string();
        self.request(|respond_to| EngineCommand::StreamingState {
            session_key,
            respond_to,
        })
        .await
    }

    pub async fn realtime_buffer(&self, session_key: &str) -> Result<Vec<Message>> {
        let session_key = session_key.to_string();
        self.request(|respond_to| EngineCommand::RealtimeBuffer {
            session_key,
            respond_to,
        })
        .await
    }

    pub async fn run_error(&self, session_key: &str) -> Result<Option<String>> {
        let session_key = session_key.to_string();
        self.request(|respond_to| EngineCommand::RunError {
            session_key,
            respond_to,
        })
        .await
    }

    /// Merge caller-supplied history with the session's realtime buffer.
    pub async fn merged_messages(
        &self,
        session_key: &str,
        persisted: Vec<Message>,
    ) -> Result<Vec<Message>> {
        let session_key = session_key.to_string();
        self.request(|respond_to| EngineCommand::MergedMessages {
            session_key,
            persisted,
            respond_to,
        })
        .await
    }

    /// Switch the session on screen. `None` means no session is shown.
    pub async fn set_active_session(&self, session_key: Option<&str>) -> Result<()> {
        let session_key = session_key.map(str::to_string);
        self.request(|respond_to| EngineCommand::SetActiveSession {
            session_key,
            respond_to,
        })
        .await
    }

    /// Re-fetch history for the active session now.
    pub async fn refresh(&self) -> Result<()> {
        self.send(EngineCommand::Refresh).await
    }

    pub async fn clear_session(&self, session_key: &str) -> Result<()> {
        let session_key = session_key.to_string();
        self.request(|respond_to| EngineCommand::ClearSession {
            session_key,
            respond_to,
        })
        .await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(EngineCommand::Shutdown).await;
        self.connection.shutdown().await;
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SyncError::ActorGone("sync engine"))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| SyncError::ActorGone("sync engine"))
    }
}

struct FetchResult {
    session_key: String,
    result: Result<Vec<Message>>,
}

pub struct SyncEngine {
    store: StreamingStore,
    history: Arc<dyn HistorySource>,
    connection: ConnectionHandle,
    events: broadcast::Receiver<StreamEvent>,
    receiver: mpsc::Receiver<EngineCommand>,
    views: broadcast::Sender<ViewUpdate>,

    active: Option<String>,
    /// Last persisted list seen per session, for publishing views between fetches.
    history_cache: HashMap<String, Vec<Message>>,
    in_flight: HashSet<String>,
    /// Sessions that asked for a fetch while one was already in flight.
    refetch_pending: HashSet<String>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    fetch_rx: mpsc::UnboundedReceiver<FetchResult>,

    poll_interval: Option<Duration>,
    next_poll: Option<Instant>,
    grace_period: Duration,
    stale_run: Option<Duration>,
    /// Clear deadlines of sessions that recently stopped being active.
    grace: HashMap<String, Instant>,
}

impl SyncEngine {
    /// Spawn the connection manager and the engine, and open the channel.
    pub fn spawn(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistorySource>,
    ) -> SyncHandle {
        let connection = ConnectionManager::spawn(config.connection.clone(), transport);
        let (sender, receiver) = mpsc::channel(64);
        let (views, _) = broadcast::channel(config.connection.event_capacity.max(1));
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let engine = SyncEngine {
            store: StreamingStore::new(),
            history,
            events: connection.subscribe(),
            connection: connection.clone(),
            receiver,
            views: views.clone(),
            active: None,
            history_cache: HashMap::new(),
            in_flight: HashSet::new(),
            refetch_pending: HashSet::new(),
            fetch_tx,
            fetch_rx,
            poll_interval: config.poll_interval,
            next_poll: None,
            grace_period: config.grace_period,
            stale_run: config.stale_run,
            grace: HashMap::new(),
        };
        tokio::spawn(engine.run());

        SyncHandle {
            sender,
            connection,
            views,
        }
    }

    /// Spawn against a real backend: SSE push channel plus HTTP history.
    pub fn spawn_http(config: SyncConfig) -> Result<SyncHandle> {
        let client = reqwest::Client::new();
        let transport = Arc::new(SseTransport::with_client(
            client.clone(),
            config.transport.clone(),
        ));
        let history = Arc::new(HttpHistorySource::with_client(client, &config.history_url)?);
        Ok(Self::spawn(config, transport, history))
    }

    async fn run(mut self) {
        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "could not start push connection");
        }

        loop {
            let next_grace = self.grace.values().min().copied();
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "engine fell behind the event stream, re-fetching");
                            if let Some(key) = self.active.clone() {
                                self.request_fetch(&key);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                Some(fetched) = self.fetch_rx.recv() => self.handle_fetch(fetched),
                _ = wait_until(self.next_poll) => self.on_poll(),
                _ = wait_until(next_grace) => self.on_grace_expired(),
            }
        }

        debug!("sync engine shut down");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StreamingState {
                session_key,
                respond_to,
            } => {
                let _ = respond_to.send(self.store.streaming_state(&session_key).cloned());
            }
            EngineCommand::RealtimeBuffer {
                session_key,
                respond_to,
            } => {
                let _ = respond_to.send(self.store.realtime_buffer(&session_key).to_vec());
            }
            EngineCommand::RunError {
                session_key,
                respond_to,
            } => {
                let _ = respond_to.send(self.store.run_error(&session_key).map(str::to_string));
            }
            EngineCommand::MergedMessages {
                session_key,
                persisted,
                respond_to,
            } => {
                if self.is_tracked(&session_key) {
                    self.history_cache
                        .insert(session_key.clone(), persisted.clone());
                }
                let merged = reconciler::merge(&mut self.store, &session_key, persisted);
                let _ = respond_to.send(merged);
            }
            EngineCommand::SetActiveSession {
                session_key,
                respond_to,
            } => {
                self.set_active(session_key);
                let _ = respond_to.send(());
            }
            EngineCommand::Refresh => {
                if let Some(key) = self.active.clone() {
                    self.request_fetch(&key);
                }
            }
            EngineCommand::ClearSession {
                session_key,
                respond_to,
            } => {
                self.forget(&session_key);
                let _ = respond_to.send(());
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn set_active(&mut self, session_key: Option<String>) {
        if self.active == session_key {
            return;
        }

        let now = Instant::now();
        if let Some(outgoing) = self.active.take() {
            debug!(session = %outgoing, "session inactive, starting grace window");
            self.grace.insert(outgoing.clone(), now + self.grace_period);
            self.request_fetch(&outgoing);
        }

        match session_key {
            Some(key) => {
                if self.grace.remove(&key).is_some() {
                    debug!(session = %key, "session returned within grace window");
                }
                info!(session = %key, "active session");
                self.active = Some(key.clone());
                self.next_poll = self.poll_interval.map(|interval| now + interval);
                self.request_fetch(&key);
            }
            None => self.next_poll = None,
        }
    }

    fn handle_event(&mut self, event: StreamEvent) {
        let outcome = self.store.ingest(&event);
        let Some(key) = event.session_key() else {
            return;
        };
        let is_active = self.active.as_deref() == Some(key);
        debug!(session = %key, ?outcome, "ingested event");

        if outcome.buffer_changed() && is_active {
            self.publish_preview(key);
        }
        if is_active && matches!(event, StreamEvent::Done(_)) {
            self.request_fetch(key);
        }
    }

    fn on_poll(&mut self) {
        self.next_poll = match (self.poll_interval, &self.active) {
            (Some(interval), Some(_)) => Some(Instant::now() + interval),
            _ => None,
        };
        let Some(key) = self.active.clone() else {
            return;
        };
        if self.store.is_streaming(&key) {
            let stale = self
                .stale_run
                .is_some_and(|max_age| self.store.drop_stale_run(&key, max_age));
            if !stale {
                debug!(session = %key, "skipping poll while streaming");
                return;
            }
            warn!(session = %key, "dropping run with no events, resuming polls");
        }
        self.request_fetch(&key);
    }

    /// Active, or inactive but still inside its grace window.
    fn is_tracked(&self, session_key: &str) -> bool {
        self.active.as_deref() == Some(session_key) || self.grace.contains_key(session_key)
    }

    fn on_grace_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .grace
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            debug!(session = %key, "grace window expired");
            self.forget(&key);
        }
    }

    /// Fetch history for a session, coalescing with an in-flight fetch.
    fn request_fetch(&mut self, session_key: &str) {
        if self.in_flight.contains(session_key) {
            self.refetch_pending.insert(session_key.to_string());
            return;
        }
        self.in_flight.insert(session_key.to_string());

        let fetch = self.history.fetch(session_key);
        let tx = self.fetch_tx.clone();
        let session_key = session_key.to_string();
        tokio::spawn(async move {
            let result = fetch.await;
            let _ = tx.send(FetchResult {
                session_key,
                result,
            });
        });
    }

    fn handle_fetch(&mut self, fetched: FetchResult) {
        let FetchResult {
            session_key,
            result,
        } = fetched;
        self.in_flight.remove(&session_key);

        match result {
            Ok(persisted) => {
                if self.is_tracked(&session_key) {
                    self.history_cache
                        .insert(session_key.clone(), persisted.clone());
                }
                let messages = reconciler::merge(&mut self.store, &session_key, persisted);
                debug!(session = %session_key, count = messages.len(), "history merged");
                let _ = self.views.send(ViewUpdate {
                    session_key: session_key.clone(),
                    messages,
                });
            }
            Err(e) => {
                warn!(session = %session_key, error = %e, "history fetch failed, skipping merge");
            }
        }

        if self.refetch_pending.remove(&session_key) {
            self.request_fetch(&session_key);
        }
    }

    fn publish_preview(&self, session_key: &str) {
        let persisted = self
            .history_cache
            .get(session_key)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let messages = reconciler::preview(&self.store, session_key, persisted);
        let _ = self.views.send(ViewUpdate {
            session_key: session_key.to_string(),
            messages,
        });
    }

    fn forget(&mut self, session_key: &str) {
        self.store.clear_session(session_key);
        self.history_cache.remove(session_key);
        self.grace.remove(session_key);
        self.refetch_pending.remove(session_key);
    }
}
