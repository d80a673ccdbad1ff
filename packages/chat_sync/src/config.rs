use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionConfig, SseTransportConfig};
use crate::error::Result;

// =============================================================================
// File config (figment-deserialized from defaults / chat_sync.toml / env vars)
// =============================================================================
//
//   chat_sync.toml:  [history]
//                    poll_interval_secs = 5
//
//   env var:         CHAT_SYNC_HISTORY__POLL_INTERVAL_SECS=5   (double underscore = nesting)

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";

/// Env var prefix for overrides.
pub const ENV_PREFIX: &str = "CHAT_SYNC_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
}

/// Where the backend lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default = "default_history_path")]
    pub history_path: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            events_path: default_events_path(),
            history_path: default_history_path(),
        }
    }
}

/// Push channel tunables (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Silent transport re-opens before a closure counts as terminal.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_transport_retry_ms")]
    pub transport_retry_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            transport_retries: default_transport_retries(),
            transport_retry_ms: default_transport_retry_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// History reconciliation tunables (`[history]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    /// 0 disables interval polling.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// A run silent this long is dropped so polling resumes. 0 keeps runs
    /// until their `done` arrives.
    #[serde(default = "default_stale_run_secs")]
    pub stale_run_secs: u64,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            grace_period_ms: default_grace_period_ms(),
            stale_run_secs: default_stale_run_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_events_path() -> String {
    "/api/events".to_string()
}
fn default_history_path() -> String {
    "/api/sessions".to_string()
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_transport_retries() -> u32 {
    2
}
fn default_transport_retry_ms() -> u64 {
    3000
}
fn default_event_capacity() -> usize {
    256
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_grace_period_ms() -> u64 {
    5000
}
fn default_stale_run_secs() -> u64 {
    60
}

/// Build a figment that layers: defaults → config file → CHAT_SYNC_* env vars.
///
/// Without an explicit path, `chat_sync.toml` in the working directory is used
/// when present.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Full push endpoint URL.
    pub events_url: String,
    /// History collection URL; session keys are appended as path segments.
    pub history_url: String,
    pub connection: ConnectionConfig,
    pub transport: SseTransportConfig,
    /// Re-fetch interval for the active session (None = disabled).
    pub poll_interval: Option<Duration>,
    /// How long an inactive session keeps its buffer before being cleared.
    pub grace_period: Duration,
    /// Silence after which a streaming run is presumed lost (None = never).
    pub stale_run: Option<Duration>,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let events_url = join_url(&fc.server.base_url, &fc.server.events_path);
        Self {
            history_url: join_url(&fc.server.base_url, &fc.server.history_path),
            connection: ConnectionConfig {
                endpoint: events_url.clone(),
                backoff_base: Duration::from_millis(fc.connection.backoff_base_ms),
                backoff_max: Duration::from_millis(fc.connection.backoff_max_ms),
                event_capacity: fc.connection.event_capacity,
            },
            events_url,
            transport: SseTransportConfig {
                retries: fc.connection.transport_retries,
                retry_delay: Duration::from_millis(fc.connection.transport_retry_ms),
            },
            poll_interval: if fc.history.poll_interval_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.history.poll_interval_secs))
            },
            grace_period: Duration::from_millis(fc.history.grace_period_ms),
            stale_run: match fc.history.stale_run_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Extract and resolve the layered config.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file: FileConfig = load_config(config_path).extract()?;
        Ok(Self::from_file(&file))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
