use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Trait every tool implements.
///
/// `execute` receives the parsed, schema-validated argument object and an
/// abort token.  Long-running tools should poll or select on the token; an
/// abort is cooperative and must move the call to a terminal state in
/// bounded time.  Errors are returned, never panicked — the executor turns
/// them into `{"error": ...}` outputs without ending the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn schema(&self) -> Value;
    async fn execute(&self, args: Value, abort: CancellationToken) -> anyhow::Result<String>;
}

/// The outcome of one executed (or rejected) tool call, in input order.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub call: magi_model::ToolCallData,
    pub output: String,
    pub is_error: bool,
}

impl ToolExecution {
    pub fn to_message(&self) -> magi_model::Message {
        magi_model::Message::function_call_output(&self.call.id, &self.output)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
