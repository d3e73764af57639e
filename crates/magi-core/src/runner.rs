//! The agent runtime: one request in, many provider turns out, until the
//! model stops calling tools or the round budget runs out.
//!
//! Events fan out to the caller exactly as the provider emitted them; the
//! accumulator folds the same events into the conversation.  Tool batches
//! run through the executor with every call registered in the running-tool
//! tracker, so cancellation and system-wide interrupts reach them.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use magi_model::{
    Conversation, Message, ModelRotation, ProviderRegistry, ProviderRequest, StreamEvent,
};
use magi_tools::{RunningToolTracker, ToolRegistry};

use crate::{
    accumulator::Accumulator, agent::Agent, cost::CostTracker, pause::PauseController,
};

/// Retries (via rotation) after a provider fails before the turn gives up.
const MAX_PROVIDER_RETRIES: u32 = 2;

/// Process-wide services threaded through every run.  Passed by reference
/// instead of reached through globals so tests can assemble their own.
#[derive(Clone)]
pub struct RunContext {
    pub providers: Arc<ProviderRegistry>,
    pub rotation: Arc<ModelRotation>,
    pub tools: Arc<ToolRegistry>,
    pub running_tools: Arc<RunningToolTracker>,
    pub pause: PauseController,
    pub cost: Arc<CostTracker>,
}

/// Drive `agent` over `conversation` until quiescent.
///
/// Every stream event is forwarded to `tx` in provider order.  The returned
/// conversation contains whatever was finalized, including partial results
/// when `cancel` fires mid-run.
pub async fn run_agent(
    ctx: &RunContext,
    agent: &Agent,
    conversation: Conversation,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<Conversation> {
    let mut conversation = conversation;
    let hooks = Arc::clone(&agent.hooks);
    let mut rounds = 0u32;
    let mut provider_retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(conversation);
        }

        hooks.on_request(agent, &mut conversation).await;

        let model = match &agent.model {
            Some(fixed) => fixed.clone(),
            None => ctx
                .rotation
                .pick(&agent.name, &agent.model_class)
                .with_context(|| {
                    format!("no model available in class '{}'", agent.model_class)
                })?,
        };

        // Pause gates new provider calls only; in-flight work is unaffected.
        ctx.pause.wait_until_running().await;
        if cancel.is_cancelled() {
            return Ok(conversation);
        }

        let provider = ctx.providers.resolve(&model)?;
        let request = ProviderRequest::new(model.clone(), conversation.clone())
            .with_tools(ctx.tools.schemas())
            .with_settings(agent.model_settings.clone())
            .with_cancel(cancel.child_token());

        debug!(agent = %agent.name, model = %model, round = rounds + 1, "provider turn");

        let stream = match provider.run(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(agent = %agent.name, model = %model, "provider call failed: {e:#}");
                let _ = tx.send(StreamEvent::error(format!("{e:#}"))).await;
                let _ = tx.send(StreamEvent::stream_end()).await;
                conversation.push(Message::developer(format!(
                    "[system error] provider call for {model} failed: {e:#}"
                )));
                provider_retries += 1;
                if agent.model.is_none() && provider_retries <= MAX_PROVIDER_RETRIES {
                    continue;
                }
                return Ok(conversation);
            }
        };

        let mut accumulator = Accumulator::new(conversation, Some(model.clone()));
        let mut stream = stream;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                ev = stream.next() => ev,
            };
            let Some(event) = next else {
                break;
            };
            let _ = tx.send(event.clone()).await;
            let done = event.is_stream_end();
            accumulator.apply(&event);
            if done {
                break;
            }
        }

        let outcome = accumulator.finish();
        conversation = outcome.conversation;

        if let Some(usage) = &outcome.usage {
            ctx.cost.record(usage);
        }
        for error in &outcome.errors {
            warn!(agent = %agent.name, "provider stream error: {error}");
        }

        for thinking in &outcome.thinking_messages {
            hooks.on_thinking(agent, thinking).await;
        }
        if let Some(message) = &outcome.assistant_message {
            hooks.on_response(agent, message).await;
        }
        for call in &outcome.tool_calls {
            hooks.on_tool_call(agent, call).await;
        }

        if cancel.is_cancelled() || outcome.tool_calls.is_empty() {
            return Ok(conversation);
        }

        let batch = ctx.tools.execute_batch(
            &outcome.tool_calls,
            &agent.name,
            &ctx.running_tools,
            agent.model_settings.sequential_tools,
        );
        tokio::pin!(batch);
        let executions = tokio::select! {
            executions = &mut batch => executions,
            _ = cancel.cancelled() => {
                // Aborts are cooperative; signal every call, then collect
                // whatever the tools finalized.
                for call in &outcome.tool_calls {
                    ctx.running_tools.abort(&call.id);
                }
                batch.await
            }
        };

        for execution in &executions {
            hooks.on_tool_result(agent, execution).await;
            conversation.push(execution.to_message());
        }

        rounds += 1;
        if rounds >= agent.max_tool_rounds {
            // Budget guard: pending results are in the conversation and
            // become visible on the next request (overseer monologue mode).
            return Ok(conversation);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use magi_config::ModelsConfig;
    use magi_model::{ItemType, Role, ScriptedProvider, ToolCallData};
    use magi_tools::Tool;

    use super::*;

    struct AddTool;

    #[async_trait]
    impl Tool for AddTool {
        fn name(&self) -> &str {
            "add"
        }
        fn description(&self) -> &str {
            "adds two numbers"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                "required": ["a", "b"]
            })
        }
        async fn execute(
            &self,
            args: Value,
            _abort: tokio_util::sync::CancellationToken,
        ) -> anyhow::Result<String> {
            Ok(format!(
                "{}",
                args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap()
            ))
        }
    }

    fn context_with(provider: ScriptedProvider) -> RunContext {
        let mut providers = ProviderRegistry::new();
        providers.set_default(Arc::new(provider));
        let mut tools = ToolRegistry::new();
        tools.register(AddTool);
        let rotation_cfg: ModelsConfig = serde_yaml::from_str(
            r#"
classes:
  standard:
    models:
      - { name: scripted-model, score: 50 }
"#,
        )
        .unwrap();
        RunContext {
            providers: Arc::new(providers),
            rotation: Arc::new(ModelRotation::from_config(&rotation_cfg)),
            tools: Arc::new(tools),
            running_tools: Arc::new(RunningToolTracker::new()),
            pause: PauseController::new(),
            cost: Arc::new(CostTracker::new()),
        }
    }

    fn user_conversation(text: &str) -> Conversation {
        let mut c = Conversation::new();
        c.push(Message::user(text));
        c
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_tool_call_round_trip() {
        let provider =
            ScriptedProvider::tool_then_text("t1", "add", r#"{"a":2,"b":2}"#, "It is 4.");
        let ctx = context_with(provider);
        let agent = Agent::new("solver");
        let (tx, rx) = mpsc::channel(256);

        let conversation = run_agent(
            &ctx,
            &agent,
            user_conversation("what is 2+2?"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // user, placeholder assistant, function_call, output, final answer
        let types: Vec<ItemType> = conversation.messages.iter().map(|m| m.item_type).collect();
        assert_eq!(
            types,
            vec![
                ItemType::Message,
                ItemType::Message,
                ItemType::FunctionCall,
                ItemType::FunctionCallOutput,
                ItemType::Message,
            ]
        );
        let output = &conversation.messages[3];
        assert_eq!(output.call_id.as_deref(), Some("t1"));
        assert_eq!(output.output.as_deref(), Some("4"));
        assert_eq!(
            conversation.messages[4].content.as_deref(),
            Some("It is 4.")
        );

        let events = drain(rx).await;
        assert!(events.iter().any(|e| e.kind_str() == "tool_call_complete"));
        assert_eq!(
            events.iter().filter(|e| e.is_stream_end()).count(),
            2,
            "one stream per provider round"
        );
    }

    #[tokio::test]
    async fn invalid_tool_args_rejected_and_run_completes() {
        let provider = ScriptedProvider::tool_then_text("t1", "add", "{oops", "recovered");
        let ctx = context_with(provider);
        let agent = Agent::new("solver");
        let (tx, _rx) = mpsc::channel(256);

        let conversation = run_agent(
            &ctx,
            &agent,
            user_conversation("add please"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let output = conversation
            .messages
            .iter()
            .find(|m| m.item_type == ItemType::FunctionCallOutput)
            .unwrap();
        assert_eq!(output.output.as_deref(), Some(r#"{"error":"invalid JSON"}"#));
    }

    #[tokio::test]
    async fn overseer_mode_stops_after_one_round() {
        // Two scripted tool rounds; with max_tool_rounds = 1 only the first
        // executes and its result is the last conversation item.
        let provider = ScriptedProvider::new(vec![
            vec![
                StreamEvent::tool_call_complete(ToolCallData::function(
                    "t1",
                    "add",
                    r#"{"a":1,"b":1}"#,
                )),
                StreamEvent::message_complete("m1", "", None),
                StreamEvent::stream_end(),
            ],
            vec![
                StreamEvent::message_complete("m2", "should never run", None),
                StreamEvent::stream_end(),
            ],
        ]);
        let ctx = context_with(provider);
        let agent = Agent::new("overseer").with_max_tool_rounds(1);
        let (tx, _rx) = mpsc::channel(256);

        let conversation = run_agent(
            &ctx,
            &agent,
            user_conversation("tick"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let last = conversation.messages.last().unwrap();
        assert_eq!(last.item_type, ItemType::FunctionCallOutput);
        assert!(!conversation
            .messages
            .iter()
            .any(|m| m.content.as_deref() == Some("should never run")));
    }

    #[tokio::test]
    async fn text_only_turn_returns_after_first_round() {
        let provider = ScriptedProvider::always_text("plain answer");
        let ctx = context_with(provider);
        let agent = Agent::new("solver");
        let (tx, rx) = mpsc::channel(256);

        let conversation = run_agent(
            &ctx,
            &agent,
            user_conversation("hello"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(conversation.len(), 2);
        let events = drain(rx).await;
        assert_eq!(events.iter().filter(|e| e.is_stream_end()).count(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let provider = ScriptedProvider::always_text("never");
        let ctx = context_with(provider);
        let agent = Agent::new("solver");
        let (tx, _rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let conversation = run_agent(&ctx, &agent, user_conversation("x"), tx, cancel)
            .await
            .unwrap();
        assert_eq!(conversation.len(), 1, "no provider call after cancel");
    }

    #[tokio::test]
    async fn cost_updates_feed_the_tracker() {
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::message_complete("m1", "done", None),
            StreamEvent::cost_update(magi_model::Usage {
                input: 100,
                output: 10,
                cached: 0,
                cost: 0.005,
                model: "scripted-model".into(),
            }),
            StreamEvent::stream_end(),
        ]]);
        let ctx = context_with(provider);
        let agent = Agent::new("solver");
        let (tx, _rx) = mpsc::channel(256);

        run_agent(
            &ctx,
            &agent,
            user_conversation("x"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!((ctx.cost.total_cost() - 0.005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hooks_observe_the_turn() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder {
            seen: Mutex<Vec<&'static str>>,
        }

        #[async_trait]
        impl crate::agent::AgentHooks for Recorder {
            async fn on_request(&self, _a: &Agent, conversation: &mut Conversation) {
                self.seen.lock().unwrap().push("request");
                conversation.push(Message::developer("injected status"));
            }
            async fn on_response(&self, _a: &Agent, _m: &Message) {
                self.seen.lock().unwrap().push("response");
            }
            async fn on_tool_call(&self, _a: &Agent, _c: &ToolCallData) {
                self.seen.lock().unwrap().push("tool_call");
            }
            async fn on_tool_result(&self, _a: &Agent, _e: &magi_tools::ToolExecution) {
                self.seen.lock().unwrap().push("tool_result");
            }
        }

        let recorder = Arc::new(Recorder::default());
        let provider = ScriptedProvider::tool_then_text("t1", "add", r#"{"a":1,"b":2}"#, "3");
        let last_request = Arc::clone(&provider.last_request);
        let ctx = context_with(provider);
        let agent = Agent::new("solver").with_hooks(Arc::clone(&recorder) as _);
        let (tx, _rx) = mpsc::channel(256);

        run_agent(
            &ctx,
            &agent,
            user_conversation("x"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "request",
                "response",
                "tool_call",
                "tool_result",
                "request",
                "response"
            ]
        );
        // The on_request rewrite reached the provider.
        let sent = last_request.lock().unwrap();
        assert!(sent
            .as_ref()
            .unwrap()
            .conversation
            .messages
            .iter()
            .any(|m| m.content.as_deref() == Some("injected status")
                && m.role == Role::Developer));
    }
}
