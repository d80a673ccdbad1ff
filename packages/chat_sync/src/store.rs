//! Per-session streaming state and realtime buffers.
//!
//! `StreamingStore` is owned by the engine task. Every push event goes through
//! [`StreamingStore::ingest`]; sessions never see each other's runs or buffers.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{DoneEvent, DoneState, StreamEvent, ToolEvent, ToolPhase};
use crate::types::{ContentPart, Message, MessageRole};

/// One tool call inside a streaming run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub phase: ToolPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// The in-flight assistant generation for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingRun {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub text: String,
    pub thinking: String,
    /// Ordered by first appearance.
    pub tool_calls: Vec<ToolCall>,
}

impl StreamingRun {
    /// Assistant message built from accumulated state, or `None` when no
    /// text was streamed.
    pub fn to_message(&self) -> Option<Message> {
        if self.text.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(2 + self.tool_calls.len());
        if !self.thinking.is_empty() {
            parts.push(ContentPart::Thinking {
                thinking: self.thinking.clone(),
            });
        }
        parts.push(ContentPart::Text {
            text: self.text.clone(),
        });
        parts.extend(self.tool_calls.iter().map(|call| ContentPart::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.args.clone().unwrap_or(Value::Null),
        }));

        Some(Message::new(MessageRole::Assistant, parts))
    }

    fn record_run_id(&mut self, run_id: Option<&String>) {
        if let Some(id) = run_id {
            self.run_id = Some(id.clone());
        }
    }

    fn apply_tool(&mut self, event: &ToolEvent, id: &str) {
        match self.tool_calls.iter_mut().find(|call| call.id == id) {
            Some(call) => {
                call.phase = event.phase;
                if event.args.is_some() {
                    call.args = event.args.clone();
                }
            }
            None => self.tool_calls.push(ToolCall {
                id: id.to_string(),
                name: event.name.clone(),
                phase: event.phase,
                args: event.args.clone(),
            }),
        }
    }
}

/// What a single `ingest` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No session state was touched.
    Ignored,
    /// The session's streaming run changed.
    RunUpdated,
    /// A new message was appended to the session's buffer.
    BufferAppended,
    /// The message was already buffered.
    Duplicate,
    /// The run ended; `appended` is whether a final message was buffered.
    RunFinished { appended: bool },
}

impl IngestOutcome {
    /// Whether the session's buffer grew.
    pub fn buffer_changed(&self) -> bool {
        matches!(
            self,
            IngestOutcome::BufferAppended | IngestOutcome::RunFinished { appended: true }
        )
    }
}

#[derive(Debug, Default)]
pub struct StreamingStore {
    runs: HashMap<String, StreamingRun>,
    buffers: HashMap<String, Vec<Message>>,
    run_errors: HashMap<String, String>,
    run_updated_at: HashMap<String, Instant>,
    last_event_at: Option<Instant>,
}

impl StreamingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one push event.
    pub fn ingest(&mut self, event: &StreamEvent) -> IngestOutcome {
        match event {
            StreamEvent::Message(e) => self.push_message(&e.session_key, e.message.clone()),
            StreamEvent::UserMessage(e) => {
                let mut message = e.message.clone();
                if e.source.is_some() {
                    message.source = e.source.clone();
                }
                self.push_message(&e.session_key, message)
            }
            StreamEvent::Chunk(e) => {
                let run = self.run_mut(&e.session_key);
                if e.replaces() {
                    run.text.clone_from(&e.text);
                } else {
                    run.text.push_str(&e.text);
                }
                run.record_run_id(e.run_id.as_ref());
                IngestOutcome::RunUpdated
            }
            StreamEvent::Thinking(e) => {
                let run = self.run_mut(&e.session_key);
                run.thinking.clone_from(&e.text);
                run.record_run_id(e.run_id.as_ref());
                IngestOutcome::RunUpdated
            }
            StreamEvent::Tool(e) => {
                let Some(id) = e.tool_call_id.as_deref() else {
                    debug!(session = %e.session_key, tool = %e.name, "dropping tool event without call id");
                    return IngestOutcome::Ignored;
                };
                let run = self.run_mut(&e.session_key);
                run.apply_tool(e, id);
                run.record_run_id(e.run_id.as_ref());
                IngestOutcome::RunUpdated
            }
            StreamEvent::Done(e) => self.finish_run(e),
            StreamEvent::Connected
            | StreamEvent::Disconnected(_)
            | StreamEvent::Heartbeat
            | StreamEvent::State(_) => IngestOutcome::Ignored,
        }
    }

    /// Drop the run, buffer and last run error of a session.
    pub fn clear_session(&mut self, session_key: &str) {
        self.runs.remove(session_key);
        self.run_updated_at.remove(session_key);
        self.buffers.remove(session_key);
        self.run_errors.remove(session_key);
        debug!(session = %session_key, "cleared session state");
    }

    /// Empty a session's buffer once history has caught up with it.
    pub(crate) fn clear_buffer(&mut self, session_key: &str) {
        self.buffers.remove(session_key);
    }

    pub fn streaming_state(&self, session_key: &str) -> Option<&StreamingRun> {
        self.runs.get(session_key)
    }

    pub fn is_streaming(&self, session_key: &str) -> bool {
        self.runs.contains_key(session_key)
    }

    pub fn realtime_buffer(&self, session_key: &str) -> &[Message] {
        self.buffers
            .get(session_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Error message of the session's last run, if it ended with `state=error`.
    pub fn run_error(&self, session_key: &str) -> Option<&str> {
        self.run_errors.get(session_key).map(String::as_str)
    }

    /// Discard a run that has seen no event for `max_age`, as when its `done`
    /// was lost. Returns whether a run was dropped.
    pub fn drop_stale_run(&mut self, session_key: &str, max_age: Duration) -> bool {
        let Some(updated_at) = self.run_updated_at.get(session_key) else {
            return false;
        };
        if updated_at.elapsed() < max_age {
            return false;
        }
        self.runs.remove(session_key);
        self.run_updated_at.remove(session_key);
        true
    }

    /// When the last message was buffered, for any session.
    pub fn last_event_at(&self) -> Option<Instant> {
        self.last_event_at
    }

    /// Sessions holding a run or buffered messages.
    pub fn session_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .runs
            .keys()
            .chain(self.buffers.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn run_mut(&mut self, session_key: &str) -> &mut StreamingRun {
        if !self.runs.contains_key(session_key) {
            debug!(session = %session_key, "run started");
            self.run_errors.remove(session_key);
        }
        self.run_updated_at
            .insert(session_key.to_string(), Instant::now());
        self.runs.entry(session_key.to_string()).or_default()
    }

    fn push_message(&mut self, session_key: &str, message: Message) -> IngestOutcome {
        let buffer = self.buffers.entry(session_key.to_string()).or_default();
        if buffer.iter().any(|existing| existing.same_message(&message)) {
            debug!(session = %session_key, "skipping duplicate realtime message");
            return IngestOutcome::Duplicate;
        }
        buffer.push(message);
        self.last_event_at = Some(Instant::now());
        IngestOutcome::BufferAppended
    }

    fn finish_run(&mut self, event: &DoneEvent) -> IngestOutcome {
        let key = event.session_key.as_str();
        let run = self.runs.remove(key);
        self.run_updated_at.remove(key);

        let final_message = match &event.message {
            Some(message) => Some(message.clone()),
            None => run.as_ref().and_then(StreamingRun::to_message),
        };

        if event.state == DoneState::Error {
            if let Some(error) = &event.error_message {
                debug!(session = %key, error = %error, "run ended with error");
                self.run_errors.insert(key.to_string(), error.clone());
            }
        }

        let appended = match final_message {
            Some(message) => self.push_message(key, message) == IngestOutcome::BufferAppended,
            None => false,
        };
        IngestOutcome::RunFinished { appended }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> StreamEvent {
        StreamEvent::parse(name, data).unwrap()
    }

    fn ingest_all(store: &mut StreamingStore, events: &[(&str, &str)]) {
        for (name, data) in events {
            store.ingest(&event(name, data));
        }
    }

    #[test]
    fn test_streaming_then_done_buffers_final_text() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"Hel","sessionKey":"s1"}"#),
                ("chunk", r#"{"text":"Hello","sessionKey":"s1"}"#),
            ],
        );
        assert_eq!(store.streaming_state("s1").unwrap().text, "Hello");

        let outcome = store.ingest(&event("done", r#"{"sessionKey":"s1"}"#));
        assert_eq!(outcome, IngestOutcome::RunFinished { appended: true });

        let buffer = store.realtime_buffer("s1");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].role, MessageRole::Assistant);
        assert_eq!(buffer[0].rendered_text(), "Hello");
        assert!(!store.is_streaming("s1"));
    }

    #[test]
    fn test_authoritative_done_message_wins() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"draft","sessionKey":"s1"}"#),
                (
                    "done",
                    r#"{"sessionKey":"s1","message":{"role":"assistant","content":[{"type":"text","text":"final"}]}}"#,
                ),
            ],
        );
        let buffer = store.realtime_buffer("s1");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].rendered_text(), "final");
    }

    #[test]
    fn test_done_with_nested_tool_result_finishes_run() {
        let mut store = StreamingStore::new();
        store.ingest(&event("chunk", r#"{"text":"draft","sessionKey":"s1"}"#));
        let outcome = store.ingest(&event(
            "done",
            r#"{"sessionKey":"s1","message":{"role":"assistant","content":[
                {"type":"text","text":"final"},
                {"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"ok"}]}
            ]}}"#,
        ));
        assert_eq!(outcome, IngestOutcome::RunFinished { appended: true });
        assert!(!store.is_streaming("s1"));
        assert_eq!(store.realtime_buffer("s1")[0].rendered_text(), "final");
    }

    #[test]
    fn test_done_with_unusable_message_falls_back_to_run_text() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"draft","sessionKey":"s1"}"#),
                ("done", r#"{"sessionKey":"s1","message":{"content":[{"type":"text","text":"x"}]}}"#),
            ],
        );
        assert!(!store.is_streaming("s1"));
        let buffer = store.realtime_buffer("s1");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].rendered_text(), "draft");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_run_is_dropped_after_max_age() {
        let max_age = Duration::from_secs(60);
        let mut store = StreamingStore::new();
        store.ingest(&event("chunk", r#"{"text":"a","sessionKey":"s1"}"#));
        assert!(!store.drop_stale_run("s1", max_age));

        tokio::time::advance(Duration::from_secs(45)).await;
        store.ingest(&event("chunk", r#"{"text":"ab","sessionKey":"s1"}"#));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(!store.drop_stale_run("s1", max_age));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(store.drop_stale_run("s1", max_age));
        assert!(!store.is_streaming("s1"));
        assert!(!store.drop_stale_run("s1", max_age));
        assert!(!store.drop_stale_run("s2", max_age));
    }

    #[test]
    fn test_explicit_false_full_replace_appends() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"Hel","sessionKey":"s1","fullReplace":false}"#),
                ("chunk", r#"{"text":"lo","sessionKey":"s1","fullReplace":false}"#),
            ],
        );
        assert_eq!(store.streaming_state("s1").unwrap().text, "Hello");

        store.ingest(&event("chunk", r#"{"text":"Reset","sessionKey":"s1","fullReplace":true}"#));
        assert_eq!(store.streaming_state("s1").unwrap().text, "Reset");
    }

    #[test]
    fn test_done_does_not_duplicate_buffered_message() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                (
                    "message",
                    r#"{"sessionKey":"s1","message":{"role":"assistant","content":"Hello"}}"#,
                ),
                ("chunk", r#"{"text":"Hello","sessionKey":"s1"}"#),
            ],
        );
        let outcome = store.ingest(&event("done", r#"{"sessionKey":"s1"}"#));
        assert_eq!(outcome, IngestOutcome::RunFinished { appended: false });
        assert_eq!(store.realtime_buffer("s1").len(), 1);
        assert!(!store.is_streaming("s1"));
    }

    #[test]
    fn test_message_dedupe_by_id_then_text() {
        let mut store = StreamingStore::new();
        let first = event(
            "message",
            r#"{"sessionKey":"s1","message":{"id":"m1","role":"user","content":"hi"}}"#,
        );
        assert_eq!(store.ingest(&first), IngestOutcome::BufferAppended);
        assert_eq!(store.ingest(&first), IngestOutcome::Duplicate);

        // Same text, different id: distinct messages.
        let other_id = event(
            "message",
            r#"{"sessionKey":"s1","message":{"id":"m2","role":"user","content":"hi"}}"#,
        );
        assert_eq!(store.ingest(&other_id), IngestOutcome::BufferAppended);

        // No id on the newcomer: falls back to role and text.
        let no_id = event("message", r#"{"sessionKey":"s1","message":{"role":"user","content":"hi"}}"#);
        assert_eq!(store.ingest(&no_id), IngestOutcome::Duplicate);

        let other_role = event(
            "message",
            r#"{"sessionKey":"s1","message":{"role":"assistant","content":"hi"}}"#,
        );
        assert_eq!(store.ingest(&other_role), IngestOutcome::BufferAppended);
        assert_eq!(store.realtime_buffer("s1").len(), 3);
    }

    #[test]
    fn test_user_message_tags_source() {
        let mut store = StreamingStore::new();
        store.ingest(&event(
            "user_message",
            r#"{"sessionKey":"s1","source":"telegram","message":{"role":"user","content":"from phone"}}"#,
        ));
        let buffer = store.realtime_buffer("s1");
        assert_eq!(buffer[0].source.as_deref(), Some("telegram"));
        assert!(store.last_event_at().is_some());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"for b","sessionKey":"b"}"#),
                ("chunk", r#"{"text":"for a","sessionKey":"a"}"#),
                ("thinking", r#"{"text":"hmm","sessionKey":"a"}"#),
                ("message", r#"{"sessionKey":"a","message":{"role":"user","content":"q"}}"#),
                ("done", r#"{"sessionKey":"a"}"#),
            ],
        );

        let b = store.streaming_state("b").unwrap();
        assert_eq!(b.text, "for b");
        assert!(b.thinking.is_empty());
        assert!(store.realtime_buffer("b").is_empty());

        assert!(!store.is_streaming("a"));
        assert_eq!(store.realtime_buffer("a").len(), 2);
        assert_eq!(store.session_keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_tool_calls_update_in_place() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                (
                    "tool",
                    r#"{"phase":"start","name":"read","toolCallId":"t1","args":{"path":"a"},"sessionKey":"s1"}"#,
                ),
                ("tool", r#"{"phase":"start","name":"grep","toolCallId":"t2","sessionKey":"s1"}"#),
                ("tool", r#"{"phase":"result","name":"read","toolCallId":"t1","sessionKey":"s1"}"#),
                ("tool", r#"{"phase":"start","name":"anon","sessionKey":"s1"}"#),
            ],
        );

        let run = store.streaming_state("s1").unwrap();
        let ids: Vec<_> = run.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(run.tool_calls[0].phase, ToolPhase::Result);
        assert_eq!(run.tool_calls[0].args, Some(serde_json::json!({"path": "a"})));
    }

    #[test]
    fn test_tool_without_id_does_not_start_run() {
        let mut store = StreamingStore::new();
        let outcome = store.ingest(&event("tool", r#"{"phase":"start","name":"x","sessionKey":"s1"}"#));
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(!store.is_streaming("s1"));
    }

    #[test]
    fn test_synthesized_message_part_order() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("thinking", r#"{"text":"plan","sessionKey":"s1","runId":"r1"}"#),
                ("tool", r#"{"phase":"start","name":"ls","toolCallId":"t1","sessionKey":"s1"}"#),
                ("chunk", r#"{"text":"done it","sessionKey":"s1"}"#),
            ],
        );
        assert_eq!(store.streaming_state("s1").unwrap().run_id.as_deref(), Some("r1"));
        store.ingest(&event("done", r#"{"sessionKey":"s1"}"#));

        let parts = store.realtime_buffer("s1")[0].parts().to_vec();
        assert!(matches!(&parts[0], ContentPart::Thinking { thinking } if thinking == "plan"));
        assert!(matches!(&parts[1], ContentPart::Text { text } if text == "done it"));
        assert!(matches!(
            &parts[2],
            ContentPart::ToolUse { id, input, .. } if id == "t1" && input.is_null()
        ));
    }

    #[test]
    fn test_done_without_text_drops_run_only() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("thinking", r#"{"text":"only thoughts","sessionKey":"s1"}"#),
                ("done", r#"{"sessionKey":"s1","state":"aborted"}"#),
            ],
        );
        assert!(!store.is_streaming("s1"));
        assert!(store.realtime_buffer("s1").is_empty());

        // A done for a session that never streamed is harmless.
        let outcome = store.ingest(&event("done", r#"{"sessionKey":"ghost"}"#));
        assert_eq!(outcome, IngestOutcome::RunFinished { appended: false });
    }

    #[test]
    fn test_error_done_records_run_error_until_next_run() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"par","sessionKey":"s1"}"#),
                ("done", r#"{"sessionKey":"s1","state":"error","errorMessage":"rate limited"}"#),
            ],
        );
        assert_eq!(store.run_error("s1"), Some("rate limited"));
        // Partial text is still kept as a message.
        assert_eq!(store.realtime_buffer("s1").len(), 1);

        store.ingest(&event("chunk", r#"{"text":"retry","sessionKey":"s1"}"#));
        assert!(store.run_error("s1").is_none());
    }

    #[test]
    fn test_lifecycle_events_are_ignored() {
        let mut store = StreamingStore::new();
        for name in ["connected", "heartbeat", "disconnected"] {
            assert_eq!(store.ingest(&event(name, "")), IngestOutcome::Ignored);
        }
        assert_eq!(
            store.ingest(&event("state", r#"{"busy":true}"#)),
            IngestOutcome::Ignored
        );
        assert!(store.session_keys().is_empty());
    }

    #[test]
    fn test_clear_session_drops_everything_for_that_session() {
        let mut store = StreamingStore::new();
        ingest_all(
            &mut store,
            &[
                ("chunk", r#"{"text":"x","sessionKey":"s1"}"#),
                ("message", r#"{"sessionKey":"s1","message":{"role":"user","content":"q"}}"#),
                ("message", r#"{"sessionKey":"s2","message":{"role":"user","content":"q"}}"#),
            ],
        );
        store.clear_session("s1");
        assert!(!store.is_streaming("s1"));
        assert!(store.realtime_buffer("s1").is_empty());
        assert_eq!(store.realtime_buffer("s2").len(), 1);
    }
}
