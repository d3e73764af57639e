use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Role, ToolCallData, Usage};

/// One normalized streaming event.  Every provider's native stream is
/// translated into this grammar; the accumulator, the agent runtime, and the
/// controller transport all consume it unchanged.
///
/// Ordering contract within a single stream: for any id `X`,
/// `start(X)` precedes every `delta(X)` which precede `complete(X)`, except
/// that a provider delivering a unit atomically may emit only the `complete`.
/// `stream_end` is emitted exactly once and is always last.  `error` may
/// appear anywhere; consumers record it and keep reading until `stream_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message_id: String,
        role: Role,
        timestamp: DateTime<Utc>,
    },
    MessageDelta {
        message_id: String,
        delta: String,
        timestamp: DateTime<Utc>,
    },
    MessageComplete {
        message_id: String,
        full_content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallData>>,
        timestamp: DateTime<Utc>,
    },
    ToolCallStart {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function_name: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ToolCallDelta {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argument_chunk: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ToolCallComplete {
        tool_call: ToolCallData,
        timestamp: DateTime<Utc>,
    },
    /// All tool calls for the turn delivered at once (providers that do not
    /// stream call fragments).
    ToolCallsChunk {
        tool_calls: Vec<ToolCallData>,
        timestamp: DateTime<Utc>,
    },
    ThinkingStart {
        thinking_id: String,
        timestamp: DateTime<Utc>,
    },
    ThinkingDelta {
        thinking_id: String,
        delta: String,
        timestamp: DateTime<Utc>,
    },
    ThinkingComplete {
        thinking_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    StreamEnd {
        timestamp: DateTime<Utc>,
    },
    CostUpdate {
        usage: Usage,
        timestamp: DateTime<Utc>,
    },
    Metadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn message_start(message_id: impl Into<String>, role: Role) -> Self {
        Self::MessageStart {
            message_id: message_id.into(),
            role,
            timestamp: Utc::now(),
        }
    }

    pub fn message_delta(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::MessageDelta {
            message_id: message_id.into(),
            delta: delta.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn message_complete(
        message_id: impl Into<String>,
        full_content: impl Into<String>,
        tool_calls: Option<Vec<ToolCallData>>,
    ) -> Self {
        Self::MessageComplete {
            message_id: message_id.into(),
            full_content: full_content.into(),
            tool_calls,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_call_start(tool_call_id: impl Into<String>, function_name: Option<String>) -> Self {
        Self::ToolCallStart {
            tool_call_id: tool_call_id.into(),
            function_name,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_call_delta(
        tool_call_id: impl Into<String>,
        function_name: Option<String>,
        argument_chunk: Option<String>,
    ) -> Self {
        Self::ToolCallDelta {
            tool_call_id: tool_call_id.into(),
            function_name,
            argument_chunk,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_call_complete(tool_call: ToolCallData) -> Self {
        Self::ToolCallComplete {
            tool_call,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_calls_chunk(tool_calls: Vec<ToolCallData>) -> Self {
        Self::ToolCallsChunk {
            tool_calls,
            timestamp: Utc::now(),
        }
    }

    pub fn thinking_start(thinking_id: impl Into<String>) -> Self {
        Self::ThinkingStart {
            thinking_id: thinking_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn thinking_delta(thinking_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            thinking_id: thinking_id.into(),
            delta: delta.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn thinking_complete(
        thinking_id: impl Into<String>,
        content: impl Into<String>,
        signature: Option<String>,
    ) -> Self {
        Self::ThinkingComplete {
            thinking_id: thinking_id.into(),
            content: content.into(),
            signature,
            timestamp: Utc::now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            code: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error_with_code(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            code: Some(code.into()),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn stream_end() -> Self {
        Self::StreamEnd {
            timestamp: Utc::now(),
        }
    }

    pub fn cost_update(usage: Usage) -> Self {
        Self::CostUpdate {
            usage,
            timestamp: Utc::now(),
        }
    }

    pub fn metadata(key: Option<String>, data: serde_json::Value) -> Self {
        Self::Metadata {
            key,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Stable kind string, matching the serde tag.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageComplete { .. } => "message_complete",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::ToolCallsChunk { .. } => "tool_calls_chunk",
            Self::ThinkingStart { .. } => "thinking_start",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ThinkingComplete { .. } => "thinking_complete",
            Self::Error { .. } => "error",
            Self::StreamEnd { .. } => "stream_end",
            Self::CostUpdate { .. } => "cost_update",
            Self::Metadata { .. } => "metadata",
        }
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(self, Self::StreamEnd { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// High-frequency kinds: streamed fragments that the transport neither
    /// persists to disk history nor double-logs.
    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            Self::MessageDelta { .. } | Self::ToolCallDelta { .. } | Self::ThinkingDelta { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_stamp_a_timestamp() {
        let before = Utc::now();
        let ev = StreamEvent::message_delta("m1", "hi");
        let after = Utc::now();
        match ev {
            StreamEvent::MessageDelta { timestamp, .. } => {
                assert!(timestamp >= before && timestamp <= after);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn kind_str_matches_serde_tag() {
        let ev = StreamEvent::stream_end();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"].as_str(), Some(ev.kind_str()));
    }

    #[test]
    fn all_kinds_round_trip_through_json() {
        let events = vec![
            StreamEvent::message_start("m1", Role::Assistant),
            StreamEvent::message_delta("m1", "chunk"),
            StreamEvent::message_complete("m1", "chunk", None),
            StreamEvent::tool_call_start("t1", Some("add".into())),
            StreamEvent::tool_call_delta("t1", None, Some("{\"a\"".into())),
            StreamEvent::tool_call_complete(ToolCallData::function("t1", "add", "{}")),
            StreamEvent::tool_calls_chunk(vec![ToolCallData::function("t2", "f", "{}")]),
            StreamEvent::thinking_start("th1"),
            StreamEvent::thinking_delta("th1", "hmm"),
            StreamEvent::thinking_complete("th1", "hmm", Some("sig".into())),
            StreamEvent::error("boom"),
            StreamEvent::stream_end(),
            StreamEvent::cost_update(Usage::default()),
            StreamEvent::metadata(Some("k".into()), serde_json::json!({"x": 1})),
        ];
        for ev in events {
            let json = serde_json::to_string(&ev).unwrap();
            let back: StreamEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back.kind_str(), ev.kind_str(), "round trip for {json}");
        }
    }

    #[test]
    fn delta_predicate_covers_exactly_the_fragment_kinds() {
        assert!(StreamEvent::message_delta("m", "x").is_delta());
        assert!(StreamEvent::tool_call_delta("t", None, None).is_delta());
        assert!(StreamEvent::thinking_delta("th", "x").is_delta());
        assert!(!StreamEvent::message_start("m", Role::Assistant).is_delta());
        assert!(!StreamEvent::stream_end().is_delta());
    }

    #[test]
    fn message_complete_omits_absent_tool_calls_field() {
        let json = serde_json::to_string(&StreamEvent::message_complete("m", "x", None)).unwrap();
        assert!(!json.contains("tool_calls"));
    }
}
