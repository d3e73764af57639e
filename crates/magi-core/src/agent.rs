use std::sync::Arc;

use async_trait::async_trait;

use magi_model::{Conversation, Message, ModelSettings, ToolCallData};
use magi_tools::ToolExecution;

/// Observation and rewrite points around one agent run.
///
/// All methods default to no-ops; implementors override what they need.
/// `on_request` runs before every provider call and may rewrite the
/// conversation (the overseer injects system status and prompt guidance
/// there).
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_request(&self, _agent: &Agent, _conversation: &mut Conversation) {}
    async fn on_response(&self, _agent: &Agent, _message: &Message) {}
    async fn on_thinking(&self, _agent: &Agent, _message: &Message) {}
    async fn on_tool_call(&self, _agent: &Agent, _call: &ToolCallData) {}
    async fn on_tool_result(&self, _agent: &Agent, _execution: &ToolExecution) {}
}

pub struct NoopHooks;

#[async_trait]
impl AgentHooks for NoopHooks {}

/// An agent definition: identity, instructions, model selection inputs, and
/// the per-run budget.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub model_class: String,
    /// Fixed model; when unset the runtime rotates within `model_class`.
    pub model: Option<String>,
    pub model_settings: ModelSettings,
    /// Tool rounds per request.  1 is overseer mode: return after one round
    /// even when tool calls remain (their results surface next turn).
    pub max_tool_rounds: u32,
    pub hooks: Arc<dyn AgentHooks>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            model_class: magi_model::STANDARD_CLASS.into(),
            model: None,
            model_settings: ModelSettings::default(),
            max_tool_rounds: 10,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_model_class(mut self, class: impl Into<String>) -> Self {
        self.model_class = class.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Seed a conversation with this agent's instructions.
    pub fn base_conversation(&self) -> Conversation {
        let mut conversation = Conversation::new();
        if !self.instructions.is_empty() {
            conversation.push(Message::system(&self.instructions));
        }
        conversation
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let agent = Agent::new("worker")
            .with_instructions("do the thing")
            .with_model_class("reasoning")
            .with_max_tool_rounds(3);
        assert_eq!(agent.name, "worker");
        assert_eq!(agent.model_class, "reasoning");
        assert_eq!(agent.max_tool_rounds, 3);
        assert!(agent.model.is_none());
    }

    #[test]
    fn base_conversation_contains_instructions() {
        let agent = Agent::new("worker").with_instructions("follow the plan");
        let conv = agent.base_conversation();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages[0].content.as_deref(), Some("follow the plan"));
    }

    #[test]
    fn base_conversation_empty_without_instructions() {
        assert!(Agent::new("w").base_conversation().is_empty());
    }
}
