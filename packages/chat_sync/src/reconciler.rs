//! Merging persisted history with the realtime buffer.

use tracing::debug;

use crate::store::StreamingStore;
use crate::types::Message;

/// Merge persisted history for `session_key` with its realtime buffer.
///
/// Returns persisted messages followed by buffered messages that history does
/// not contain yet, in arrival order. Once history contains every buffered
/// message the buffer is cleared.
pub fn merge(store: &mut StreamingStore, session_key: &str, persisted: Vec<Message>) -> Vec<Message> {
    let buffer = store.realtime_buffer(session_key);
    if buffer.is_empty() {
        return persisted;
    }

    let pending: Vec<Message> = buffer
        .iter()
        .filter(|buffered| !persisted.iter().any(|p| p.same_message(buffered)))
        .cloned()
        .collect();

    if pending.is_empty() {
        debug!(session = %session_key, "history caught up, clearing realtime buffer");
        store.clear_buffer(session_key);
        return persisted;
    }

    debug!(
        session = %session_key,
        pending = pending.len(),
        "appending realtime messages not yet in history"
    );
    let mut merged = persisted;
    merged.extend(pending);
    merged
}

/// Like [`merge`] but never clears the buffer. Used for read-only views.
pub fn preview(store: &StreamingStore, session_key: &str, persisted: &[Message]) -> Vec<Message> {
    let mut merged = persisted.to_vec();
    merged.extend(
        store
            .realtime_buffer(session_key)
            .iter()
            .filter(|buffered| !persisted.iter().any(|p| p.same_message(buffered)))
            .cloned(),
    );
    merged
}
