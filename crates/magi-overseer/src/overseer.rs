//! The overseer monologue loop: an endless stream of reasoning turns.
//!
//! Each turn merges pending sub-agent threads, compacts history when it
//! grows past budget, injects the system status and a prompt-guide nudge,
//! runs one single-round agent turn, and folds the turn's new messages back
//! into history.  Between turns the loop sleeps for the configured thought
//! delay, interruptibly: fresh human input or a system command aborts the
//! pause.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use magi_comm::{CommClient, ControllerMessage};
use magi_config::Config;
use magi_core::{
    categorize, run_agent, Agent, History, MessageCategory, RunContext, Summarizer,
};
use magi_model::{Conversation, Message, ModelSettings, ProviderRequest};
use magi_supervisor::TaskSupervisor;

use crate::{
    guide::{choose_guide, nudge_text, PromptGuide},
    memory::MemoryStore,
    status::{render_system_status, StatusInputs},
};

pub const MONOLOGUE_CLASS: &str = "monologue";
pub const SUMMARY_CLASS: &str = "summary";

const TASK_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(600);

const OVERSEER_INSTRUCTIONS: &str = "\
You are the overseer of a multi-agent system. You think in a continuous \
monologue. You never execute work yourself: you delegate by starting tasks, \
guide them with messages, and report to the user with your talk tool. Keep \
thoughts short. Prefer acting through tools over narrating intentions.";

pub struct Overseer {
    ctx: RunContext,
    config: Arc<Config>,
    history: Arc<Mutex<History>>,
    supervisor: Arc<TaskSupervisor>,
    memory: Arc<MemoryStore>,
    thought_delay_secs: Arc<AtomicU64>,
    client: CommClient,
    talk_tool_name: String,
    started_at: DateTime<Utc>,
    agent: Agent,
}

impl Overseer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: RunContext,
        config: Arc<Config>,
        supervisor: Arc<TaskSupervisor>,
        memory: Arc<MemoryStore>,
        thought_delay_secs: Arc<AtomicU64>,
        client: CommClient,
    ) -> Self {
        let user_slug = config
            .overseer
            .user_name
            .to_lowercase()
            .replace(char::is_whitespace, "_");
        let history = History::new(
            &config.overseer.ai_name,
            config.overseer.history_token_limit,
        );
        let agent = Agent::new(&config.overseer.ai_name)
            .with_description("long-running overseer monologue")
            .with_instructions(OVERSEER_INSTRUCTIONS)
            .with_model_class(MONOLOGUE_CLASS)
            .with_max_tool_rounds(1);
        Self {
            ctx,
            config,
            history: Arc::new(Mutex::new(history)),
            supervisor,
            memory,
            thought_delay_secs,
            client,
            talk_tool_name: format!("talk_to_{user_slug}"),
            started_at: Utc::now(),
            agent,
        }
    }

    pub fn history(&self) -> Arc<Mutex<History>> {
        Arc::clone(&self.history)
    }

    /// Run the monologue until `shutdown` fires.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<ControllerMessage>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(ai = %self.config.overseer.ai_name, "overseer loop starting");
        let mut last_health_sweep = tokio::time::Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("overseer loop shutting down");
                return Ok(());
            }

            self.drain_inbound(&mut inbound).await;

            if last_health_sweep.elapsed() >= TASK_HEALTH_CHECK_INTERVAL {
                last_health_sweep = tokio::time::Instant::now();
                self.spawn_health_sweep();
            }

            if let Err(e) = self.run_turn(shutdown.child_token()).await {
                warn!("monologue turn failed: {e:#}");
                self.history
                    .lock()
                    .await
                    .push(Message::developer(format!("[system error] {e:#}")));
            }

            self.thought_pause(&shutdown).await;
        }
    }

    /// Apply queued controller messages.  Fresh human input interrupts any
    /// blocking wait so the next turn starts immediately.
    async fn drain_inbound(&self, inbound: &mut mpsc::UnboundedReceiver<ControllerMessage>) {
        let mut new_messages = Vec::new();
        while let Ok(message) = inbound.try_recv() {
            new_messages.extend(self.supervisor.handle_controller_message(message));
        }
        if new_messages.is_empty() {
            return;
        }
        let user_spoke = new_messages
            .iter()
            .any(|m| categorize(m) == MessageCategory::UserSaid);
        self.history.lock().await.extend(new_messages);
        if user_spoke {
            self.ctx.running_tools.interrupt_waiting("fresh user input");
        }
    }

    fn spawn_health_sweep(&self) {
        let supervisor = Arc::clone(&self.supervisor);
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            let stuck = supervisor.check_all_task_health();
            if !stuck.is_empty() {
                debug!(count = stuck.len(), "health sweep found stalled tasks");
                history.lock().await.push_thread(vec![Message::developer(format!(
                    "[system] health sweep: tasks with no recent progress: {}",
                    stuck.join(", ")
                ))]);
            }
        });
    }

    /// One monologue turn.
    async fn run_turn(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Phase 1 under the history lock: merge threads, compact, snapshot.
        let (snapshot, guide) = {
            let mut history = self.history.lock().await;
            let merged = history.drain_threads();
            if merged > 0 {
                debug!(merged, "merged sub-agent threads");
            }
            let summarizer = ProviderSummarizer {
                ctx: self.ctx.clone(),
            };
            history.compact(&summarizer).await;
            let guide = choose_guide(history.messages(), self.config.overseer.mind_wandering);
            (history.messages().to_vec(), guide)
        };

        let mut conversation = self.agent.base_conversation();
        conversation.extend(snapshot);
        conversation.push(Message::developer(self.render_status()));
        if let Some(nudge) = nudge_text(guide, &self.talk_tool_name) {
            conversation.push(Message::developer(nudge));
        }
        let input_len = conversation.len();

        let mut agent = self.agent.clone();
        if guide == PromptGuide::AnswerUser {
            agent.model_settings.tool_choice = Some(self.talk_tool_name.clone());
        }

        // Fan the turn's events out to the controller while the runner works.
        let (tx, mut rx) = mpsc::channel(256);
        let client = self.client.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                client.send(magi_comm::EngineEvent::Stream(event));
            }
        });

        let final_conversation =
            run_agent(&self.ctx, &agent, conversation, tx, cancel).await?;
        let _ = forwarder.await;

        // Fold the turn back into history: assistant prose becomes a
        // monologue entry, everything else is appended verbatim.
        let mut history = self.history.lock().await;
        for message in &final_conversation.messages[input_len..] {
            match (&message.item_type, &message.content) {
                (magi_model::ItemType::Message, Some(text))
                    if message.role == magi_model::Role::Assistant && !text.is_empty() =>
                {
                    history.add_monologue(text);
                }
                _ => history.push(message.clone()),
            }
        }
        Ok(())
    }

    fn render_status(&self) -> String {
        let active_tasks = self.supervisor.tracker().active();
        let running_tools = self.ctx.running_tools.running();
        let memories = self.memory.short_term();
        let projects: Vec<String> = active_tasks
            .iter()
            .flat_map(|t| t.project_ids.iter().cloned())
            .collect();
        render_system_status(&StatusInputs {
            started_at: self.started_at,
            thought_delay_secs: self.thought_delay_secs.load(Ordering::Relaxed),
            active_projects: &projects,
            active_tasks: &active_tasks,
            running_tools: &running_tools,
            short_term_memories: &memories,
        })
    }

    /// Sleep the configured thought delay, interruptibly.  The pause is
    /// registered as a waiting tool so `interrupt_waiting` cuts it short.
    async fn thought_pause(&self, shutdown: &CancellationToken) {
        let delay = self.thought_delay_secs.load(Ordering::Relaxed);
        if delay == 0 {
            return;
        }
        let wait_id = format!("thought_delay_{}", Utc::now().timestamp_millis());
        let abort = self.ctx.running_tools.start(
            &wait_id,
            "wait_for_running_tool",
            &self.agent.name,
            &format!(r#"{{"thought_delay":{delay}}}"#),
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(delay)) => {
                self.ctx.running_tools.finish(&wait_id, magi_tools::RunningToolStatus::Completed);
            }
            _ = abort.cancelled() => {
                debug!("thought delay interrupted");
            }
            _ = shutdown.cancelled() => {}
        }
        self.ctx.running_tools.prune_finished();
    }
}

// ─── Summarizer backed by a provider call ─────────────────────────────────────

const SUMMARIZE_INSTRUCTIONS: &str = "\
You compact conversation history. Summarise the following messages in a \
dense, retention-oriented way: keep decisions, task ids, open questions, \
user requests, and anything needed to continue the work. Reply with the \
summary only.";

struct ProviderSummarizer {
    ctx: RunContext,
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, history_text: &str) -> anyhow::Result<String> {
        let model = self
            .ctx
            .rotation
            .pick("summarizer", SUMMARY_CLASS)
            .ok_or_else(|| anyhow::anyhow!("no model available for summaries"))?;
        let provider = self.ctx.providers.resolve(&model)?;

        let mut conversation = Conversation::new();
        conversation.push(Message::system(SUMMARIZE_INSTRUCTIONS));
        conversation.push(Message::user(history_text));

        let request = ProviderRequest::new(&model, conversation.clone())
            .with_settings(ModelSettings::default());
        let stream = provider.run(request).await?;
        let outcome = magi_core::Accumulator::fold(conversation, Some(model), stream).await;
        if let Some(usage) = &outcome.usage {
            self.ctx.cost.record(usage);
        }
        if let Some(error) = outcome.errors.first() {
            anyhow::bail!("summarizer stream error: {error}");
        }
        outcome
            .assistant_message
            .and_then(|m| m.content)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("summarizer returned no text"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use magi_comm::CommClientConfig;
    use magi_core::{CostTracker, PauseController};
    use magi_model::{ModelRotation, ProviderRegistry, ScriptedProvider, StreamEvent};
    use magi_supervisor::{ProcessTracker, RecordingPtyBus};
    use magi_tools::{RunningToolTracker, ToolRegistry};

    use super::*;
    use crate::tools::overseer_registry;

    fn test_client() -> CommClient {
        let mut config = CommClientConfig::new("AI-core01", "127.0.0.1", 1);
        config.test_mode = true;
        CommClient::start(config, None).0
    }

    fn rotation() -> ModelRotation {
        let cfg: magi_config::ModelsConfig = serde_yaml::from_str(
            r#"
classes:
  monologue:
    models:
      - { name: scripted-model, score: 50 }
  summary:
    models:
      - { name: scripted-model, score: 50 }
"#,
        )
        .unwrap();
        ModelRotation::from_config(&cfg)
    }

    fn overseer_with(provider: ScriptedProvider, dir: &std::path::Path) -> Overseer {
        let mut providers = ProviderRegistry::new();
        providers.set_default(Arc::new(provider));

        let client = test_client();
        let running_tools = Arc::new(RunningToolTracker::new());
        let pause = PauseController::new();
        let supervisor = Arc::new(TaskSupervisor::new(
            Arc::new(ProcessTracker::new()),
            Arc::clone(&running_tools),
            pause.clone(),
            client.clone(),
            Arc::new(RecordingPtyBus::new()),
            300,
        ));
        let memory = Arc::new(MemoryStore::open(dir).unwrap());
        let thought_delay = Arc::new(AtomicU64::new(0));
        let config = Arc::new(Config::default());

        let tools: ToolRegistry = overseer_registry(
            &config.overseer.user_name,
            client.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&memory),
            Arc::clone(&thought_delay),
            config.tasks.wait_timeout_secs,
        );

        let ctx = RunContext {
            providers: Arc::new(providers),
            rotation: Arc::new(rotation()),
            tools: Arc::new(tools),
            running_tools,
            pause,
            cost: Arc::new(CostTracker::new()),
        };
        Overseer::new(ctx, config, supervisor, memory, thought_delay, client)
    }

    #[tokio::test]
    async fn turn_appends_monologue_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = overseer_with(
            ScriptedProvider::always_text("I should check on the tasks."),
            dir.path(),
        );
        overseer.run_turn(CancellationToken::new()).await.unwrap();

        let history = overseer.history.lock().await;
        let last = history.messages().last().unwrap();
        assert_eq!(
            last.content.as_deref(),
            Some("Magi thoughts: I should check on the tasks.")
        );
    }

    #[tokio::test]
    async fn status_and_nudge_are_turn_local() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = overseer_with(ScriptedProvider::always_text("quiet tick"), dir.path());
        overseer.run_turn(CancellationToken::new()).await.unwrap();

        let history = overseer.history.lock().await;
        assert!(
            !history
                .messages()
                .iter()
                .any(|m| m.content.as_deref().is_some_and(|c| c.contains("=== System Status ==="))),
            "status injection must not persist in history"
        );
    }

    #[tokio::test]
    async fn turn_executes_tool_calls_in_single_round() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::tool_call_complete(magi_model::ToolCallData::function(
                "c1",
                "save_memory",
                r#"{"term":"short","memory":"remember the deploy window"}"#,
            )),
            StreamEvent::message_complete("m1", "", None),
            StreamEvent::stream_end(),
        ]]);
        let overseer = overseer_with(provider, dir.path());
        overseer.run_turn(CancellationToken::new()).await.unwrap();

        assert_eq!(overseer.memory.short_term().len(), 1);
        let history = overseer.history.lock().await;
        // function_call + paired output recorded for the next turn.
        assert!(history
            .messages()
            .iter()
            .any(|m| m.item_type == magi_model::ItemType::FunctionCall));
        assert!(history
            .messages()
            .iter()
            .any(|m| m.item_type == magi_model::ItemType::FunctionCallOutput));
    }

    #[tokio::test]
    async fn unanswered_user_forces_talk_tool_choice() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::always_text("on it");
        let last_request = Arc::clone(&provider.last_request);
        let overseer = overseer_with(provider, dir.path());
        overseer
            .history
            .lock()
            .await
            .push(Message::user("User said: are you there?"));

        overseer.run_turn(CancellationToken::new()).await.unwrap();

        let request = last_request.lock().unwrap();
        let request = request.as_ref().unwrap();
        assert_eq!(
            request.settings.tool_choice.as_deref(),
            Some("talk_to_user")
        );
        assert!(request.conversation.messages.iter().any(|m| m
            .content
            .as_deref()
            .is_some_and(|c| c.contains("waiting for a reply"))));
    }

    #[tokio::test(start_paused = true)]
    async fn thought_pause_is_interruptible() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = overseer_with(ScriptedProvider::always_text("x"), dir.path());
        overseer.thought_delay_secs.store(128, Ordering::Relaxed);

        let running_tools = Arc::clone(&overseer.ctx.running_tools);
        let interrupter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            running_tools.interrupt_waiting("test")
        });

        let started = tokio::time::Instant::now();
        overseer.thought_pause(&CancellationToken::new()).await;
        assert!(
            started.elapsed() < Duration::from_secs(127),
            "pause must end early on interrupt"
        );
        assert_eq!(interrupter.await.unwrap().len(), 1);
    }
}
