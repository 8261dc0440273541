//! Message primitives and the fluent [`ChatMessage`] builder.
//!
//! A [`ChatMessage`] is an ordered sequence of role/content entries plus an
//! optional set of stored bindings.  It is the unit that flows into
//! [`ChatRequest`](crate::omnillm::request::ChatRequest) assembly, pipelines,
//! and agents.
//!
//! # Building a conversation
//!
//! ```rust
//! use omnillm::ChatMessage;
//!
//! let msg = ChatMessage::new()
//!     .system("You are a terse assistant.")
//!     .user("What is ${topic}?")
//!     .bind([("topic", "Rust")]);
//!
//! let rendered = msg.render();
//! assert_eq!(rendered.entries()[1].content.as_text(), "What is Rust?");
//! ```
//!
//! # System-message invariant
//!
//! A conversation holds at most one `system` entry.  Adding a second one
//! silently replaces the first, keeping its original position.

use crate::omnillm::error::AiError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The possible roles for a message entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Primes or constrains assistant behaviour.  At most one per conversation.
    System,
    /// A user-authored message.
    User,
    /// A model-authored message (or a supplied exemplar).
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool,
    /// Developer instructions, distinct from `system` on providers that
    /// support the role; mapped to `system` elsewhere.
    Developer,
}

impl Role {
    /// Wire-format name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Developer => "developer",
        }
    }

    /// Parse a role name.  Matching is case-insensitive; unknown names are
    /// [`AiError::InvalidArgument`].
    pub fn from_name(name: &str) -> Result<Role, AiError> {
        match name.to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "developer" => Ok(Role::Developer),
            other => Err(AiError::InvalidArgument(format!(
                "unknown message role '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a structured multi-part content value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text body.
        text: String,
    },
    /// An image reference, by URL or data URI.
    ImageUrl {
        /// Image location.
        url: String,
    },
    /// Inline audio data.
    Audio {
        /// Base64-encoded audio bytes.
        data: String,
        /// Container format (`"wav"`, `"mp3"`, ...).
        format: String,
    },
    /// Inline document data (PDF and friends).
    Document {
        /// Base64-encoded document bytes.
        data: String,
        /// MIME type of the document.
        media_type: String,
    },
}

/// Message content: a plain string or a structured multi-part array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// A plain text body.
    Text(String),
    /// Mixed text/image/audio/document parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten the content to text.  Multi-part values concatenate their
    /// text parts; non-text parts contribute nothing.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// True when the content carries no text and no parts.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

/// A single tool call requested by the model in a native function-calling
/// response.  Providers assign an opaque `id` so the tool result can be
/// correlated back in a follow-up `tool` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the definitions sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model.
    pub arguments: serde_json::Value,
}

/// A single entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Role of the author.
    pub role: Role,
    /// The message body.
    pub content: MessageContent,
    /// Correlation ID for `tool` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls requested by the assistant.  Non-empty only on assistant
    /// entries produced from native function-calling responses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl MessageEntry {
    /// Build an entry with plain text content and no tool bookkeeping.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Ordered message sequence with optional stored bindings.
///
/// The builder methods consume and return `self` so conversations read as
/// fluent chains.  All mutation happens during assembly; rendering
/// (`format`/`render`) produces a new value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatMessage {
    entries: Vec<MessageEntry>,
    bindings: HashMap<String, String>,
}

impl ChatMessage {
    /// Start an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append (or replace) the `system` message.
    pub fn system(self, content: impl Into<MessageContent>) -> Self {
        self.push_entry(MessageEntry::new(Role::System, content))
    }

    /// Append a `user` message.
    pub fn user(self, content: impl Into<MessageContent>) -> Self {
        self.push_entry(MessageEntry::new(Role::User, content))
    }

    /// Append an `assistant` message.
    pub fn assistant(self, content: impl Into<MessageContent>) -> Self {
        self.push_entry(MessageEntry::new(Role::Assistant, content))
    }

    /// Append a `tool` result message correlated to `call_id`.
    pub fn tool(self, call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        let mut entry = MessageEntry::new(Role::Tool, content);
        entry.tool_call_id = Some(call_id.into());
        self.push_entry(entry)
    }

    /// Append a `developer` message.
    pub fn developer(self, content: impl Into<MessageContent>) -> Self {
        self.push_entry(MessageEntry::new(Role::Developer, content))
    }

    /// Append a message by role name.
    ///
    /// This is the generic form behind the fluent role methods: any name
    /// that resolves to a known role appends a message with that role;
    /// anything else is [`AiError::InvalidArgument`].
    pub fn add_message(
        self,
        role_name: &str,
        content: impl Into<MessageContent>,
    ) -> Result<Self, AiError> {
        let role = Role::from_name(role_name)?;
        Ok(self.push_entry(MessageEntry::new(role, content)))
    }

    /// Append a prebuilt entry, enforcing the single-system invariant.
    pub fn push(self, entry: MessageEntry) -> Self {
        self.push_entry(entry)
    }

    /// Flatten another conversation (or a slice of entries) into this one.
    ///
    /// Entries are appended in order; a `system` entry in the history
    /// replaces the existing one per the invariant.
    pub fn history<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = MessageEntry>,
    {
        for entry in entries {
            self = self.push_entry(entry);
        }
        self
    }

    fn push_entry(mut self, entry: MessageEntry) -> Self {
        if entry.role == Role::System {
            if let Some(existing) = self.entries.iter_mut().find(|e| e.role == Role::System) {
                existing.content = entry.content;
                return self;
            }
        }
        self.entries.push(entry);
        self
    }

    /// Replace the `system` message content, inserting one at the front if
    /// the conversation has none.
    pub fn replace_system_message(mut self, content: impl Into<MessageContent>) -> Self {
        let content = content.into();
        match self.entries.iter_mut().find(|e| e.role == Role::System) {
            Some(existing) => existing.content = content,
            None => self
                .entries
                .insert(0, MessageEntry::new(Role::System, content)),
        }
        self
    }

    /// Every entry except the `system` one, in order.
    pub fn get_non_system_messages(&self) -> Vec<&MessageEntry> {
        self.entries
            .iter()
            .filter(|e| e.role != Role::System)
            .collect()
    }

    /// The `system` entry, when present.
    pub fn system_message(&self) -> Option<&MessageEntry> {
        self.entries.iter().find(|e| e.role == Role::System)
    }

    /// Borrow the entry list.
    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the conversation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the builder, yielding the entry list.
    pub fn into_entries(self) -> Vec<MessageEntry> {
        self.entries
    }

    /// Store default bindings for `${key}` placeholders.
    ///
    /// Stored bindings are lower priority than the runtime bindings passed
    /// to [`format`](ChatMessage::format).
    pub fn bind<K, V, I>(mut self, bindings: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in bindings {
            self.bindings.insert(key.into(), value.into());
        }
        self
    }

    /// Borrow the stored bindings.
    pub fn bindings(&self) -> &HashMap<String, String> {
        &self.bindings
    }

    /// Render `${key}` placeholders using stored bindings merged with the
    /// supplied runtime bindings (runtime wins).  Unresolved placeholders
    /// remain literal.  Placeholder syntax is fixed; there is no escaping.
    pub fn format(&self, runtime: &HashMap<String, String>) -> ChatMessage {
        let mut merged = self.bindings.clone();
        for (key, value) in runtime {
            merged.insert(key.clone(), value.clone());
        }
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let mut rendered = entry.clone();
                rendered.content = render_content(&entry.content, &merged);
                rendered
            })
            .collect();
        ChatMessage {
            entries,
            bindings: self.bindings.clone(),
        }
    }

    /// Render using only the stored bindings.
    pub fn render(&self) -> ChatMessage {
        self.format(&HashMap::new())
    }

    /// Emit each entry, in order, to a callback.
    pub fn stream<F>(&self, mut on_message: F)
    where
        F: FnMut(&MessageEntry),
    {
        for entry in &self.entries {
            on_message(entry);
        }
    }
}

impl From<&str> for ChatMessage {
    /// A bare string becomes a single `user` message.
    fn from(value: &str) -> Self {
        ChatMessage::new().user(value)
    }
}

impl From<String> for ChatMessage {
    fn from(value: String) -> Self {
        ChatMessage::new().user(value)
    }
}

fn render_content(content: &MessageContent, bindings: &HashMap<String, String>) -> MessageContent {
    match content {
        MessageContent::Text(text) => MessageContent::Text(render_placeholders(text, bindings)),
        MessageContent::Parts(parts) => MessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentPart::Text {
                        text: render_placeholders(text, bindings),
                    },
                    other => other.clone(),
                })
                .collect(),
        ),
    }
}

/// Resolve `${name}` placeholders against a binding map, leaving unresolved
/// ones literal.
fn render_placeholders(text: &str, bindings: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match bindings.get(key) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push_str("${");
                        output.push_str(key);
                        output.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder: keep the remainder literal.
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_system_message_is_replaced() {
        let msg = ChatMessage::new()
            .system("first")
            .user("hello")
            .system("second");
        let systems: Vec<_> = msg
            .entries()
            .iter()
            .filter(|e| e.role == Role::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content.as_text(), "second");
        // Original position preserved.
        assert_eq!(msg.entries()[0].role, Role::System);
    }

    #[test]
    fn replace_system_inserts_at_front_when_absent() {
        let msg = ChatMessage::new().user("hi").replace_system_message("sys");
        assert_eq!(msg.entries()[0].role, Role::System);
        assert_eq!(msg.entries()[0].content.as_text(), "sys");
    }

    #[test]
    fn bindings_merge_runtime_wins() {
        let msg = ChatMessage::new()
            .user("${greeting}, ${name}!")
            .bind([("greeting", "Hello"), ("name", "stored")]);
        let mut runtime = HashMap::new();
        runtime.insert("name".to_string(), "runtime".to_string());
        let rendered = msg.format(&runtime);
        assert_eq!(rendered.entries()[0].content.as_text(), "Hello, runtime!");
    }

    #[test]
    fn unresolved_placeholders_stay_literal() {
        let msg = ChatMessage::new().user("value is ${missing}");
        let rendered = msg.render();
        assert_eq!(rendered.entries()[0].content.as_text(), "value is ${missing}");
    }

    #[test]
    fn unterminated_placeholder_stays_literal() {
        let msg = ChatMessage::new().user("broken ${open");
        let rendered = msg.render();
        assert_eq!(rendered.entries()[0].content.as_text(), "broken ${open");
    }

    #[test]
    fn add_message_rejects_unknown_role() {
        let result = ChatMessage::new().add_message("wizard", "abracadabra");
        assert!(matches!(result, Err(AiError::InvalidArgument(_))));
    }

    #[test]
    fn add_message_accepts_any_case() {
        let msg = ChatMessage::new().add_message("Assistant", "ok").unwrap();
        assert_eq!(msg.entries()[0].role, Role::Assistant);
    }

    #[test]
    fn history_flattens_and_respects_system_invariant() {
        let base = ChatMessage::new().system("base").user("one");
        let extra = vec![
            MessageEntry::new(Role::System, "override"),
            MessageEntry::new(Role::Assistant, "two"),
        ];
        let merged = base.history(extra);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.system_message().unwrap().content.as_text(), "override");
    }

    #[test]
    fn multipart_content_flattens_text() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "see ".into(),
            },
            ContentPart::ImageUrl {
                url: "https://example.com/cat.png".into(),
            },
            ContentPart::Text {
                text: "this".into(),
            },
        ]);
        assert_eq!(content.as_text(), "see this");
    }

    #[test]
    fn stream_emits_in_order() {
        let msg = ChatMessage::new().system("s").user("u").assistant("a");
        let mut roles = Vec::new();
        msg.stream(|entry| roles.push(entry.role));
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }
}
