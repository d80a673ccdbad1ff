//! Error types for the sync engine.

/// Errors surfaced by the library API.
///
/// None of these are fatal to the engine: transport failures are retried with
/// backoff and history failures simply skip a merge.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("{0} actor is gone")]
    ActorGone(&'static str),
}

impl SyncError {
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::InvalidEndpoint {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(Box::new(err))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
