//! Pull side: the authoritative persisted message list per session.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::types::Message;

/// Fetches persisted history for a session.
pub trait HistorySource: Send + Sync + 'static {
    fn fetch(&self, session_key: &str) -> BoxFuture<'static, Result<Vec<Message>>>;
}

/// History body: either a bare array or wrapped in `messages`.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    List(Vec<Value>),
    Wrapped { messages: Vec<Value> },
}

impl From<HistoryBody> for Vec<Message> {
    /// Entries that do not decode as a message are skipped.
    fn from(body: HistoryBody) -> Self {
        let (HistoryBody::List(entries) | HistoryBody::Wrapped { messages: entries }) = body;
        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!(index, "Skipping undecodable history entry: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// `GET {base}{history_path}/{session_key}/messages`
#[derive(Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpHistorySource {
    /// `base` is the collection URL, e.g. `http://127.0.0.1:3000/api/sessions`.
    pub fn new(base: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(client: reqwest::Client, base: &str) -> Result<Self> {
        let base = reqwest::Url::parse(base).map_err(|e| SyncError::invalid_endpoint(base, e))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::invalid_endpoint(base.as_str(), "cannot be a base URL"));
        }
        Ok(Self { client, base })
    }

    /// Messages URL for one session; the key is escaped as one path segment.
    pub fn messages_url(&self, session_key: &str) -> Result<reqwest::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::invalid_endpoint(self.base.as_str(), "cannot be a base URL"))?
            .pop_if_empty()
            .push(session_key)
            .push("messages");
        Ok(url)
    }
}

impl HistorySource for HttpHistorySource {
    fn fetch(&self, session_key: &str) -> BoxFuture<'static, Result<Vec<Message>>> {
        let client = self.client.clone();
        let url = self.messages_url(session_key);
        Box::pin(async move {
            let url = url?;
            debug!(url = %url, "fetching history");
            let response = client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SyncError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            let bytes = response.bytes().await?;
            let body: HistoryBody = serde_json::from_slice(&bytes)?;
            Ok(body.into())
        })
    }
}
