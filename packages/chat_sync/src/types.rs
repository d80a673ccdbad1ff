use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A finalized chat message, as served by the history endpoint or delivered
/// over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, alias = "message_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub role: MessageRole,

    #[serde(default)]
    pub content: MessageContent,

    /// Originating external channel, set for messages that arrived through
    /// `user_message` events (e.g. `"telegram"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Plain string or ordered parts. Anything else decodes as empty parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Parts(Vec::new())
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(text) => MessageContent::Text(text),
            Value::Array(items) => {
                MessageContent::Parts(items.into_iter().map(ContentPart::from_value).collect())
            }
            _ => MessageContent::default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        /// String or nested parts, kept as sent.
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Catch-all for unknown content types
    #[serde(other)]
    Unknown,
}

impl ContentPart {
    /// Decode one part; a part that does not fit its declared type becomes
    /// [`ContentPart::Unknown`] instead of failing the whole message.
    fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(ContentPart::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    /// Any role this client does not know.
    #[serde(other)]
    Other,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<ContentPart>) -> Self {
        Self {
            id: None,
            role,
            content: MessageContent::Parts(parts),
            source: None,
            timestamp: None,
        }
    }

    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The text a reader sees: all text parts joined by newlines. Thinking and
    /// tool parts do not contribute.
    pub fn rendered_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether `self` and `other` denote the same logical message.
    ///
    /// Ids decide when both sides carry one. Otherwise role plus exact
    /// rendered text; two distinct messages with identical text in the same
    /// role are indistinguishable here.
    pub fn same_message(&self, other: &Message) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.role == other.role && self.rendered_text() == other.rendered_text(),
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        match &self.content {
            MessageContent::Parts(parts) => parts,
            MessageContent::Text(_) => &[],
        }
    }
}
