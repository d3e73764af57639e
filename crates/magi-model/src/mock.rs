use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{EventStream, Provider, ProviderRequest},
    Role, StreamEvent, ToolCallData,
};

/// Deterministic provider for tests: echoes the last user message.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let id = uuid::Uuid::new_v4().to_string();
        let events = vec![
            StreamEvent::message_start(&id, Role::Assistant),
            StreamEvent::message_delta(&id, format!("ECHO: {reply}")),
            StreamEvent::message_complete(&id, format!("ECHO: {reply}"), None),
            StreamEvent::stream_end(),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted provider.  Each `run` call pops the next event script from
/// the front of the queue, so tests can exercise exact sequences — including
/// tool calls and errors — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last request seen, captured so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ProviderRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider that always streams a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        let id = "m1".to_string();
        Self::new(vec![vec![
            StreamEvent::message_start(&id, Role::Assistant),
            StreamEvent::message_delta(&id, &r),
            StreamEvent::message_complete(&id, &r, None),
            StreamEvent::stream_end(),
        ]])
    }

    /// Provider that emits one tool call, then (on the next call) a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let call = ToolCallData::function(tool_id, tool_name, args_json);
        let text = final_text.into();
        Self::new(vec![
            vec![
                StreamEvent::message_start("m1", Role::Assistant),
                StreamEvent::tool_call_complete(call),
                StreamEvent::message_complete("m1", "", None),
                StreamEvent::stream_end(),
            ],
            vec![
                StreamEvent::message_start("m2", Role::Assistant),
                StreamEvent::message_delta("m2", &text),
                StreamEvent::message_complete("m2", &text, None),
                StreamEvent::stream_end(),
            ],
        ])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    StreamEvent::message_complete("m_done", "[no more scripts]", None),
                    StreamEvent::stream_end(),
                ]
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
