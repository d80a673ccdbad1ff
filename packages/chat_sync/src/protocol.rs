//! Push Channel Protocol Types
//!
//! Named events delivered over the shared SSE channel. Every session-scoped
//! event names its session explicitly: one connection carries all sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::sse::SseFrame;
use crate::types::Message;

/// Phase of a tool call as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    InputDelta,
    Update,
    Result,
    #[serde(other)]
    Other,
}

/// Terminal state reported by a `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneState {
    #[default]
    Final,
    Error,
    Aborted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub session_key: String,
    /// Absent means replace. Only an explicit `false` appends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_replace: Option<bool>,
}

impl ChunkEvent {
    pub fn replaces(&self) -> bool {
        self.full_replace != Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub session_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub phase: ToolPhase,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub session_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub message: Message,
    pub session_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageEvent {
    pub message: Message,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    #[serde(default)]
    pub state: DoneState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub session_key: String,
    /// Authoritative final message. Wins over locally accumulated text.
    /// An undecodable message is dropped so the run still finishes.
    #[serde(
        default,
        deserialize_with = "lenient_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<Message>,
}

fn lenient_message<'de, D>(deserializer: D) -> Result<Option<Message>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(value) = Option::<Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(message) => Ok(Some(message)),
        Err(e) => {
            debug!("Dropping undecodable done message: {}", e);
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Events received over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    // === Connection lifecycle (no session key) ===
    Connected,
    Disconnected(DisconnectedEvent),
    Heartbeat,

    // === Session-scoped ===
    Chunk(ChunkEvent),
    Thinking(ThinkingEvent),
    Tool(ToolEvent),
    Message(MessageEvent),
    UserMessage(UserMessageEvent),
    Done(DoneEvent),

    /// Advisory backend state; carried through untouched.
    State(Value),
}

impl StreamEvent {
    /// Parse one named SSE event.
    ///
    /// Returns `None` for unknown event names and malformed payloads; neither
    /// is an error for the channel.
    pub fn parse(event_name: &str, data: &str) -> Option<StreamEvent> {
        let result = match event_name {
            "connected" => Ok(StreamEvent::Connected),
            "heartbeat" => Ok(StreamEvent::Heartbeat),
            "disconnected" => {
                if data.trim().is_empty() {
                    Ok(StreamEvent::Disconnected(DisconnectedEvent::default()))
                } else {
                    serde_json::from_str(data).map(StreamEvent::Disconnected)
                }
            }
            "chunk" => serde_json::from_str(data).map(StreamEvent::Chunk),
            "thinking" => serde_json::from_str(data).map(StreamEvent::Thinking),
            "tool" => serde_json::from_str(data).map(StreamEvent::Tool),
            "message" => serde_json::from_str(data).map(StreamEvent::Message),
            "user_message" => serde_json::from_str(data).map(StreamEvent::UserMessage),
            "done" => serde_json::from_str(data).map(StreamEvent::Done),
            "state" => serde_json::from_str(data).map(StreamEvent::State),
            other => {
                debug!(event = %other, "ignoring unknown event type");
                return None;
            }
        };

        match result {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(event = %event_name, error = %e, "dropping malformed event payload");
                None
            }
        }
    }

    pub fn from_frame(frame: &SseFrame) -> Option<StreamEvent> {
        Self::parse(&frame.event, &frame.data)
    }

    /// Session the event belongs to, or `None` for lifecycle/advisory events.
    pub fn session_key(&self) -> Option<&str> {
        match self {
            StreamEvent::Chunk(e) => Some(&e.session_key),
            StreamEvent::Thinking(e) => Some(&e.session_key),
            StreamEvent::Tool(e) => Some(&e.session_key),
            StreamEvent::Message(e) => Some(&e.session_key),
            StreamEvent::UserMessage(e) => Some(&e.session_key),
            StreamEvent::Done(e) => Some(&e.session_key),
            StreamEvent::Connected
            | StreamEvent::Disconnected(_)
            | StreamEvent::Heartbeat
            | StreamEvent::State(_) => None,
        }
    }
}
