use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Roles and item kinds ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Developer,
    System,
    Tool,
}

/// What a conversation item represents on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Message,
    FunctionCall,
    FunctionCallOutput,
    Thinking,
}

// ─── Tool calls ───────────────────────────────────────────────────────────────

/// A tool invocation as emitted by a model.  `arguments` is the JSON-encoded
/// argument object exactly as the provider produced it; parsing happens at
/// validation time so malformed arguments can be rejected per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCallData,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallData {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCallData {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "function".into(),
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Pairing identifier — aliases `id`.
    pub fn call_id(&self) -> &str {
        &self.id
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single conversation item.  Immutable once appended to a [`Conversation`];
/// the history compactor may splice a synthesized summary in place of a
/// chosen subset but never mutates surviving items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Function name (`function_call` items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON-encoded arguments (`function_call` items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Pairing id shared between a `function_call` and its output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Captured result (`function_call_output` items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_id: Option<String>,
    /// Provider signature over a thinking block, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Model that produced this item, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            item_type: ItemType::Message,
            id: Some(Uuid::new_v4().to_string()),
            content: Some(content.into()),
            name: None,
            arguments: None,
            call_id: None,
            output: None,
            thinking_id: None,
            signature: None,
            timestamp: Utc::now(),
            model: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Self::text(Role::Developer, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn function_call(call: &ToolCallData) -> Self {
        Self {
            role: Role::Assistant,
            item_type: ItemType::FunctionCall,
            id: Some(Uuid::new_v4().to_string()),
            content: None,
            name: Some(call.function.name.clone()),
            arguments: Some(call.function.arguments.clone()),
            call_id: Some(call.id.clone()),
            output: None,
            thinking_id: None,
            signature: None,
            timestamp: Utc::now(),
            model: None,
        }
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            item_type: ItemType::FunctionCallOutput,
            id: Some(Uuid::new_v4().to_string()),
            content: None,
            name: None,
            arguments: None,
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            thinking_id: None,
            signature: None,
            timestamp: Utc::now(),
            model: None,
        }
    }

    pub fn thinking(
        thinking_id: impl Into<String>,
        content: impl Into<String>,
        signature: Option<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            item_type: ItemType::Thinking,
            id: Some(Uuid::new_v4().to_string()),
            content: Some(content.into()),
            name: None,
            arguments: None,
            call_id: None,
            output: None,
            thinking_id: Some(thinking_id.into()),
            signature,
            timestamp: Utc::now(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Total characters carried by this item, the basis of the chars/4 token
    /// heuristic used for compaction budgeting.
    pub fn char_len(&self) -> usize {
        self.content.as_deref().map(str::len).unwrap_or(0)
            + self.name.as_deref().map(str::len).unwrap_or(0)
            + self.arguments.as_deref().map(str::len).unwrap_or(0)
            + self.output.as_deref().map(str::len).unwrap_or(0)
    }

    /// Approximate token count (4 chars per token, minimum 1).
    pub fn approx_tokens(&self) -> usize {
        (self.char_len() / 4).max(1)
    }
}

// ─── Conversation ─────────────────────────────────────────────────────────────

/// Ordered message sequence owned by one agent invocation.  Append-only in
/// steady state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.messages.extend(msgs);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token usage and cost from one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    /// Tokens served from the provider's prompt cache.
    pub cached: u64,
    /// Dollar cost computed from the pricing table.
    pub cost: f64,
    pub model: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_carries_role_and_content() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.item_type, ItemType::Message);
        assert_eq!(m.content.as_deref(), Some("hello"));
    }

    #[test]
    fn function_call_message_mirrors_tool_call() {
        let tc = ToolCallData::function("t1", "add", r#"{"a":2,"b":2}"#);
        let m = Message::function_call(&tc);
        assert_eq!(m.item_type, ItemType::FunctionCall);
        assert_eq!(m.name.as_deref(), Some("add"));
        assert_eq!(m.call_id.as_deref(), Some("t1"));
        assert_eq!(m.arguments.as_deref(), Some(r#"{"a":2,"b":2}"#));
    }

    #[test]
    fn function_call_output_pairs_by_call_id() {
        let m = Message::function_call_output("t1", "4");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.call_id.as_deref(), Some("t1"));
        assert_eq!(m.output.as_deref(), Some("4"));
    }

    #[test]
    fn thinking_message_keeps_signature() {
        let m = Message::thinking("th1", "reasoning...", Some("sig".into()));
        assert_eq!(m.item_type, ItemType::Thinking);
        assert_eq!(m.signature.as_deref(), Some("sig"));
    }

    #[test]
    fn call_id_aliases_id() {
        let tc = ToolCallData::function("abc", "f", "{}");
        assert_eq!(tc.call_id(), tc.id);
    }

    #[test]
    fn approx_tokens_divides_chars_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn conversation_tokens_sum_over_messages() {
        let mut c = Conversation::new();
        c.push(Message::user("12345678")); // 2
        c.push(Message::assistant("abcd")); // 1
        assert_eq!(c.approx_tokens(), 3);
    }

    #[test]
    fn conversations_have_unique_ids() {
        assert_ne!(Conversation::new().id, Conversation::new().id);
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::function_call_output("c9", "ok");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.call_id.as_deref(), Some("c9"));
        assert_eq!(back.item_type, ItemType::FunctionCallOutput);
    }

    #[test]
    fn tool_call_serializes_kind_as_type() {
        let tc = ToolCallData::function("x", "f", "{}");
        let json = serde_json::to_string(&tc).unwrap();
        assert!(json.contains(r#""type":"function""#));
    }
}
