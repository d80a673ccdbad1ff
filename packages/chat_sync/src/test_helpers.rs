use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::connection::{Transport, TransportSignal};
use crate::error::{Result, SyncError};
use crate::history::HistorySource;
use crate::sse::SseFrame;
use crate::types::Message;

/// A named SSE frame as the transport would deliver it.
pub fn frame(event: &str, data: &str) -> TransportSignal {
    TransportSignal::Frame(SseFrame {
        event: event.to_string(),
        data: data.to_string(),
        id: None,
    })
}

/// One connection opened through [`ScriptedTransport`]. The test drives it by
/// pushing signals; dropping it ends the connection like a vanished stream.
pub struct ScriptedConnection {
    pub endpoint: String,
    signals: mpsc::Sender<TransportSignal>,
}

impl ScriptedConnection {
    pub async fn send(&self, signal: TransportSignal) {
        let _ = self.signals.send(signal).await;
    }

    pub async fn open(&self) {
        self.send(TransportSignal::Open).await;
    }

    pub async fn close(&self, reason: Option<&str>) {
        self.send(TransportSignal::Closed(reason.map(str::to_string)))
            .await;
    }

    pub async fn event(&self, event: &str, data: &str) {
        self.send(frame(event, data)).await;
    }

    /// The manager has torn this connection down.
    pub fn is_abandoned(&self) -> bool {
        self.signals.is_closed()
    }
}

/// Transport whose connections are handed to the test instead of the network.
pub struct ScriptedTransport {
    connections: mpsc::UnboundedSender<ScriptedConnection>,
    fail_next: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connections: tx,
            fail_next: Mutex::new(None),
        });
        (transport, rx)
    }

    /// Make the next `connect` fail synchronously.
    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }
}

impl Transport for ScriptedTransport {
    fn connect(
        &self,
        endpoint: &str,
        signals: mpsc::Sender<TransportSignal>,
    ) -> Result<BoxFuture<'static, ()>> {
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(SyncError::invalid_endpoint(endpoint, reason));
        }
        let _ = self.connections.send(ScriptedConnection {
            endpoint: endpoint.to_string(),
            signals,
        });
        Ok(Box::pin(std::future::pending()))
    }
}

#[derive(Default)]
struct CannedInner {
    responses: HashMap<String, Vec<Message>>,
    failing: HashSet<String>,
    calls: Vec<String>,
    delay: Duration,
}

/// History source serving whatever the test put in it, answered at the time
/// the fetch completes.
#[derive(Clone, Default)]
pub struct CannedHistory {
    inner: Arc<Mutex<CannedInner>>,
}

impl CannedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session_key: &str, messages: Vec<Message>) {
        self.inner
            .lock()
            .unwrap()
            .responses
            .insert(session_key.to_string(), messages);
    }

    pub fn fail(&self, session_key: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing
            .insert(session_key.to_string());
    }

    /// Make every fetch take this long.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = delay;
    }

    /// Session keys fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, session_key: &str) -> usize {
        self.calls().iter().filter(|k| *k == session_key).count()
    }
}

impl HistorySource for CannedHistory {
    fn fetch(&self, session_key: &str) -> BoxFuture<'static, Result<Vec<Message>>> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(session_key.to_string());
            inner.delay
        };
        let inner = self.inner.clone();
        let session_key = session_key.to_string();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let inner = inner.lock().unwrap();
            if inner.failing.contains(&session_key) {
                return Err(SyncError::Status {
                    status: 503,
                    url: format!("canned://{session_key}"),
                });
            }
            Ok(inner.responses.get(&session_key).cloned().unwrap_or_default())
        })
    }
}

/// Config with short, round timings for paused-clock tests.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.connection.endpoint = "http://test.invalid/api/events".to_string();
    config.poll_interval = Some(Duration::from_secs(10));
    config.grace_period = Duration::from_secs(5);
    config
}

/// Let spawned tasks run until they are all idle again.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
