//! The overseer's tool surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use magi_comm::{CommClient, ProcessEvent};
use magi_supervisor::TaskSupervisor;
use magi_tools::{Tool, ToolRegistry};

use crate::memory::{MemoryStore, MemoryTerm};

/// Allowed monologue pacing values, seconds.
pub const THOUGHT_DELAY_VALUES: &[u64] = &[0, 2, 4, 8, 16, 32, 64, 128];

fn str_arg(args: &Value, key: &str) -> String {
    args[key].as_str().unwrap_or_default().to_string()
}

// ─── talk_to_<user> ───────────────────────────────────────────────────────────

pub struct TalkToUserTool {
    name: String,
    client: CommClient,
}

impl TalkToUserTool {
    pub fn new(user_name: &str, client: CommClient) -> Self {
        let slug = user_name.to_lowercase().replace(char::is_whitespace, "_");
        Self {
            name: format!("talk_to_{slug}"),
            client,
        }
    }
}

#[async_trait]
impl Tool for TalkToUserTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Send a message to the user. This is the only way the user hears from you."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "What to tell the user" },
                "affect": {
                    "type": "string",
                    "description": "Emotional tone of the message, e.g. neutral, warm, urgent"
                },
                "document": {
                    "type": "string",
                    "description": "Optional longer markdown document to attach"
                },
                "incomplete": {
                    "type": "boolean",
                    "description": "True when more messages will follow shortly"
                }
            },
            "required": ["message", "affect"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        self.client.send(ProcessEvent::Talk {
            message: str_arg(&args, "message"),
            affect: str_arg(&args, "affect"),
            document: args["document"].as_str().map(str::to_string),
            incomplete: args["incomplete"].as_bool().unwrap_or(false),
        });
        Ok("Message sent to the user".into())
    }
}

// ─── Task tools ───────────────────────────────────────────────────────────────

pub struct StartTaskTool {
    supervisor: Arc<TaskSupervisor>,
}

#[async_trait]
impl Tool for StartTaskTool {
    fn name(&self) -> &str {
        "start_task"
    }
    fn description(&self) -> &str {
        "Create an isolated worker task. The task runs in its own engine and \
         reports progress back; use wait_for_running_task or get_task_status \
         to follow it."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Short display name" },
                "task": { "type": "string", "description": "What the worker must do" },
                "context": { "type": "string", "description": "Background the worker needs" },
                "warnings": { "type": "string", "description": "Pitfalls to avoid" },
                "goal": { "type": "string", "description": "Definition of done" },
                "type": {
                    "type": "string",
                    "enum": ["task", "research", "code", "browse"],
                    "description": "Worker kind"
                },
                "project": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Up to 3 existing project ids to mount"
                }
            },
            "required": ["name", "task", "context", "warnings", "goal", "type"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let projects: Vec<String> = args["project"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let id = self.supervisor.start_task(
            &str_arg(&args, "name"),
            &str_arg(&args, "task"),
            &str_arg(&args, "context"),
            &str_arg(&args, "warnings"),
            &str_arg(&args, "goal"),
            &str_arg(&args, "type"),
            projects,
        )?;
        Ok(format!("Started task {id}"))
    }
}

pub struct SendMessageTool {
    supervisor: Arc<TaskSupervisor>,
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }
    fn description(&self) -> &str {
        "Send guidance to a running task. The command 'stop' terminates it."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "command": { "type": "string" }
            },
            "required": ["taskId", "command"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        self.supervisor
            .send_message(&str_arg(&args, "taskId"), &str_arg(&args, "command"))
    }
}

pub struct GetTaskStatusTool {
    supervisor: Arc<TaskSupervisor>,
}

#[async_trait]
impl Tool for GetTaskStatusTool {
    fn name(&self) -> &str {
        "get_task_status"
    }
    fn description(&self) -> &str {
        "Show a task's status; detailed=true includes the full command and output."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "detailed": { "type": "boolean" }
            },
            "required": ["taskId"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        self.supervisor.get_task_status(
            &str_arg(&args, "taskId"),
            args["detailed"].as_bool().unwrap_or(false),
        )
    }
}

pub struct CheckAllTaskHealthTool {
    supervisor: Arc<TaskSupervisor>,
}

#[async_trait]
impl Tool for CheckAllTaskHealthTool {
    fn name(&self) -> &str {
        "check_all_task_health"
    }
    fn description(&self) -> &str {
        "List tasks that look stuck (no progress for a while, not finished)."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let stuck = self.supervisor.check_all_task_health();
        Ok(if stuck.is_empty() {
            "All tasks healthy".into()
        } else {
            format!("Possibly stuck tasks: {}", stuck.join(", "))
        })
    }
}

pub struct WaitForRunningTaskTool {
    supervisor: Arc<TaskSupervisor>,
    default_timeout_secs: u64,
}

#[async_trait]
impl Tool for WaitForRunningTaskTool {
    fn name(&self) -> &str {
        "wait_for_running_task"
    }
    fn description(&self) -> &str {
        "Block until a task finishes, fails, or the timeout passes. Emits a \
         waiting heartbeat every minute."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "timeout": { "type": "integer", "description": "Seconds, default 1800" }
            },
            "required": ["taskId"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let timeout = args["timeout"].as_u64().unwrap_or(self.default_timeout_secs);
        Ok(self
            .supervisor
            .wait_for_running_task(&str_arg(&args, "taskId"), timeout)
            .await)
    }
}

// ─── set_thought_delay ────────────────────────────────────────────────────────

pub struct SetThoughtDelayTool {
    delay_secs: Arc<AtomicU64>,
}

#[async_trait]
impl Tool for SetThoughtDelayTool {
    fn name(&self) -> &str {
        "set_thought_delay"
    }
    fn description(&self) -> &str {
        "Change the pause between your thoughts. Use short delays while working, \
         long ones while idle."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "delay": { "type": "integer", "enum": THOUGHT_DELAY_VALUES }
            },
            "required": ["delay"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let delay = args["delay"].as_u64().unwrap_or(0);
        if !THOUGHT_DELAY_VALUES.contains(&delay) {
            anyhow::bail!("delay must be one of {THOUGHT_DELAY_VALUES:?}");
        }
        self.delay_secs.store(delay, Ordering::Relaxed);
        Ok(format!("Thought delay set to {delay}s"))
    }
}

// ─── Memory tools ─────────────────────────────────────────────────────────────

pub struct SaveMemoryTool {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }
    fn description(&self) -> &str {
        "Save a memory. Short-term memories appear in your status; long-term \
         ones are found with find_memory."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "term": { "type": "string", "enum": ["short", "long"] },
                "memory": { "type": "string" }
            },
            "required": ["term", "memory"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let term = MemoryTerm::parse(&str_arg(&args, "term"))
            .ok_or_else(|| anyhow::anyhow!("term must be short or long"))?;
        let id = self.store.save(term, str_arg(&args, "memory"));
        Ok(format!("Saved memory {id}"))
    }
}

pub struct FindMemoryTool {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for FindMemoryTool {
    fn name(&self) -> &str {
        "find_memory"
    }
    fn description(&self) -> &str {
        "Search saved memories by query terms."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let queries: Vec<String> = args["query"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let found = self.store.find(&queries);
        if found.is_empty() {
            return Ok("No matching memories".into());
        }
        Ok(found
            .iter()
            .map(|e| format!("[{}] {}", e.id, e.memory))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct DeleteMemoryTool {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for DeleteMemoryTool {
    fn name(&self) -> &str {
        "delete_memory"
    }
    fn description(&self) -> &str {
        "Delete a saved memory by term and id."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "term": { "type": "string", "enum": ["short", "long"] },
                "id": { "type": "integer" }
            },
            "required": ["term", "id"]
        })
    }
    async fn execute(&self, args: Value, _abort: CancellationToken) -> anyhow::Result<String> {
        let term = MemoryTerm::parse(&str_arg(&args, "term"))
            .ok_or_else(|| anyhow::anyhow!("term must be short or long"))?;
        let id = args["id"].as_u64().unwrap_or(0);
        if self.store.delete(term, id) {
            Ok(format!("Deleted memory {id}"))
        } else {
            anyhow::bail!("no such memory: {id}")
        }
    }
}

// ─── Registry assembly ────────────────────────────────────────────────────────

/// Build the full overseer tool registry.
pub fn overseer_registry(
    user_name: &str,
    client: CommClient,
    supervisor: Arc<TaskSupervisor>,
    memory: Arc<MemoryStore>,
    thought_delay_secs: Arc<AtomicU64>,
    wait_timeout_secs: u64,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(TalkToUserTool::new(user_name, client));
    registry.register(StartTaskTool {
        supervisor: Arc::clone(&supervisor),
    });
    registry.register(SendMessageTool {
        supervisor: Arc::clone(&supervisor),
    });
    registry.register(GetTaskStatusTool {
        supervisor: Arc::clone(&supervisor),
    });
    registry.register(CheckAllTaskHealthTool {
        supervisor: Arc::clone(&supervisor),
    });
    registry.register(WaitForRunningTaskTool {
        supervisor,
        default_timeout_secs: wait_timeout_secs,
    });
    registry.register(SetThoughtDelayTool {
        delay_secs: thought_delay_secs,
    });
    registry.register(SaveMemoryTool {
        store: Arc::clone(&memory),
    });
    registry.register(FindMemoryTool {
        store: Arc::clone(&memory),
    });
    registry.register(DeleteMemoryTool { store: memory });
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
