use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{Conversation, StreamEvent};

/// A lazy, finite, non-restartable sequence of normalized events produced by
/// one provider call.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// JSON-Schema description of one tool, as offered to the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Per-request model settings carried on the agent.
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider-level forced tool choice (`"auto"`, `"none"`, or a tool name).
    pub tool_choice: Option<String>,
    /// Execute tool batches one at a time instead of concurrently.
    pub sequential_tools: bool,
}

/// One completion request handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub conversation: Conversation,
    pub tools: Vec<ToolSchema>,
    pub settings: ModelSettings,
    /// Caller-side cancellation flag.  The adapter must stop reading the
    /// upstream within one network buffer once this fires.
    pub cancel: CancellationToken,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            model: model.into(),
            conversation,
            tools: Vec::new(),
            settings: ModelSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A model provider adapter.  Translates the conversation into the provider's
/// native request shape and the native response back into the event grammar.
///
/// Errors raised before the stream opens (missing key, unreachable host)
/// surface as `Err`; failures after the first byte are reported in-band as an
/// `error` event followed by `stream_end`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name for logs and dispatch diagnostics.
    fn name(&self) -> &str;

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<EventStream>;
}

/// Apply `additionalProperties: false` to every object schema in the tree so
/// models cannot invent free-form extensions to tool arguments.
pub fn enforce_strict_objects(schema: &mut serde_json::Value) {
    match schema {
        serde_json::Value::Object(map) => {
            if map.get("type").and_then(|t| t.as_str()) == Some("object") {
                map.entry("additionalProperties")
                    .or_insert(serde_json::Value::Bool(false));
            }
            for v in map.values_mut() {
                enforce_strict_objects(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                enforce_strict_objects(v);
            }
        }
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
