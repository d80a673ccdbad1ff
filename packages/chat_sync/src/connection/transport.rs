//! Transport seam for the push channel.
//!
//! A transport turns one logical `connect` into a stream of
//! [`TransportSignal`]s. It may re-open the underlying stream on its own
//! (emitting [`TransportSignal::Error`] and then [`TransportSignal::Open`]
//! again); only [`TransportSignal::Closed`] is terminal.

use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::sse::{SseDecoder, SseFrame};

/// What the transport reports back to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The stream is open (initially or after a silent re-open).
    Open,
    /// One decoded SSE frame.
    Frame(SseFrame),
    /// Non-terminal trouble; the transport is retrying by itself.
    Error(String),
    /// The transport gave up. No further signals follow.
    Closed(Option<String>),
}

/// Opens push connections.
///
/// `connect` validates the endpoint synchronously and returns the future that
/// drives the connection. The future ends when the connection is terminally
/// closed or when `signals` is dropped by the receiver.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &str,
        signals: mpsc::Sender<TransportSignal>,
    ) -> Result<BoxFuture<'static, ()>>;
}

/// Options for [`SseTransport`].
#[derive(Debug, Clone)]
pub struct SseTransportConfig {
    /// Silent re-opens allowed after a dropped stream before giving up.
    pub retries: u32,
    /// Wait between silent re-opens when the server sent no `retry:` hint.
    pub retry_delay: Duration,
}

impl Default for SseTransportConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_delay: Duration::from_millis(3000),
        }
    }
}

/// `text/event-stream` over a streaming reqwest GET.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    config: SseTransportConfig,
}

impl SseTransport {
    pub fn new(config: SseTransportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn with_client(client: reqwest::Client, config: SseTransportConfig) -> Self {
        Self { client, config }
    }
}

impl Transport for SseTransport {
    fn connect(
        &self,
        endpoint: &str,
        signals: mpsc::Sender<TransportSignal>,
    ) -> Result<BoxFuture<'static, ()>> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| SyncError::invalid_endpoint(endpoint, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::invalid_endpoint(
                endpoint,
                format!("unsupported scheme {}", url.scheme()),
            ));
        }

        let client = self.client.clone();
        let config = self.config.clone();
        Ok(Box::pin(run_sse(client, url, config, signals)))
    }
}

/// How one open stream ended.
enum StreamEnd {
    /// Dropped or errored; eligible for a silent re-open.
    Dropped(String),
    /// Refused by the server; terminal.
    Refused(String),
    /// Receiver went away; stop quietly.
    Abandoned,
}

async fn run_sse(
    client: reqwest::Client,
    url: reqwest::Url,
    config: SseTransportConfig,
    signals: mpsc::Sender<TransportSignal>,
) {
    let mut decoder = SseDecoder::new();
    let mut failures = 0u32;

    loop {
        match stream_once(&client, &url, &mut decoder, &signals, &mut failures).await {
            StreamEnd::Abandoned => return,
            StreamEnd::Refused(reason) => {
                let _ = signals.send(TransportSignal::Closed(Some(reason))).await;
                return;
            }
            StreamEnd::Dropped(reason) => {
                failures += 1;
                if failures > config.retries {
                    warn!(url = %url, failures, "event stream retries exhausted: {}", reason);
                    let _ = signals.send(TransportSignal::Closed(Some(reason))).await;
                    return;
                }
                debug!(url = %url, failures, "event stream dropped, re-opening: {}", reason);
                if signals.send(TransportSignal::Error(reason)).await.is_err() {
                    return;
                }
                decoder.reset();
                let delay = decoder
                    .retry_ms()
                    .map(Duration::from_millis)
                    .unwrap_or(config.retry_delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn stream_once(
    client: &reqwest::Client,
    url: &reqwest::Url,
    decoder: &mut SseDecoder,
    signals: &mpsc::Sender<TransportSignal>,
    failures: &mut u32,
) -> StreamEnd {
    let mut request = client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = decoder.last_event_id() {
        request = request.header("Last-Event-ID", id);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return StreamEnd::Dropped(format!("connect failed: {e}")),
    };

    let status = response.status();
    if !status.is_success() {
        return StreamEnd::Refused(format!("server responded {status}"));
    }

    info!(url = %url, "event stream open");
    *failures = 0;
    if signals.send(TransportSignal::Open).await.is_err() {
        return StreamEnd::Abandoned;
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return StreamEnd::Dropped(format!("stream read failed: {e}")),
        };
        for frame in decoder.feed(&chunk) {
            if signals.send(TransportSignal::Frame(frame)).await.is_err() {
                return StreamEnd::Abandoned;
            }
        }
    }

    StreamEnd::Dropped("stream ended".to_string())
}
