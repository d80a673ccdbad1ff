//! # chat_sync
//!
//! Client-side realtime sync for a chat backend.
//!
//! ## Overview
//!
//! A chat UI typically shows one conversation at a time while the backend
//! streams events for all of them. This crate keeps that picture consistent:
//! - One shared SSE push channel for every session, with exponential
//!   reconnect backoff ([`connection`])
//! - Per-session streaming runs and realtime message buffers ([`store`])
//! - Reconciliation of buffered messages with the persisted history the
//!   backend serves ([`reconciler`], [`history`])
//! - An engine task that owns all of it and exposes a cloneable handle
//!   ([`engine`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_sync::{SyncConfig, SyncEngine};
//!
//! # async fn run() -> chat_sync::Result<()> {
//! let config = SyncConfig::load(None)?;
//! let handle = SyncEngine::spawn_http(config)?;
//!
//! handle.set_active_session(Some("agent:main")).await?;
//! let mut views = handle.subscribe_views();
//! while let Ok(view) = views.recv().await {
//!     println!("{}: {} messages", view.session_key, view.messages.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Message identity
//!
//! A buffered message counts as persisted when history holds a message with
//! the same id, or, when either side has no id, the same role and exact
//! rendered text. Two distinct messages with identical text in the same role
//! are therefore treated as one.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history;
pub mod protocol;
pub mod reconciler;
pub mod sse;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use config::{FileConfig, SyncConfig, load_config};
pub use connection::{ConnectionState, ConnectionStatus};
pub use engine::{SyncEngine, SyncHandle, ViewUpdate};
pub use error::{Result, SyncError};
pub use history::{HistorySource, HttpHistorySource};
pub use protocol::StreamEvent;
pub use store::{IngestOutcome, StreamingRun, StreamingStore, ToolCall};
pub use types::{ContentPart, Message, MessageContent, MessageRole};
