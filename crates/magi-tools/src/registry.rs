use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use magi_model::{ToolCallData, ToolSchema};

use crate::{
    running::{RunningToolStatus, RunningToolTracker},
    tool::{Tool, ToolExecution},
    validate::validate_call,
};

/// Central name → tool mapping plus the batch executor.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-facing schemas, sorted by name for deterministic requests.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a batch of calls.
    ///
    /// Outputs are returned in input order regardless of completion order.
    /// Invalid calls are rejected without executing; execution errors and
    /// panics become `{"error": ...}` outputs.  Every dispatched call is
    /// tracked in `tracker` for the lifetime of its execution.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallData],
        agent_name: &str,
        tracker: &RunningToolTracker,
        sequential: bool,
    ) -> Vec<ToolExecution> {
        if sequential {
            let mut out = Vec::with_capacity(calls.len());
            for call in calls {
                out.push(self.execute_one(call, agent_name, tracker).await);
            }
            return out;
        }

        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            // Validation happens inside the task so a bad call cannot stall
            // the batch; the task owns its clones.
            let call = call.clone();
            let agent = agent_name.to_string();
            let tool = self.get(&call.function.name);
            let tracker_start =
                tracker.start(&call.id, &call.function.name, agent, &call.function.arguments);
            let handle = tokio::spawn(run_call(call, tool, tracker_start));
            handles.push(handle);
        }

        let mut out = Vec::with_capacity(calls.len());
        for (i, handle) in handles.into_iter().enumerate() {
            let exec = match handle.await {
                Ok(exec) => exec,
                Err(e) => ToolExecution {
                    call: calls[i].clone(),
                    output: serde_json::json!({ "error": format!("tool panicked: {e}") })
                        .to_string(),
                    is_error: true,
                },
            };
            tracker.finish(
                &calls[i].id,
                if exec.is_error {
                    RunningToolStatus::Failed
                } else {
                    RunningToolStatus::Completed
                },
            );
            out.push(exec);
        }
        out
    }

    async fn execute_one(
        &self,
        call: &ToolCallData,
        agent_name: &str,
        tracker: &RunningToolTracker,
    ) -> ToolExecution {
        let tool = self.get(&call.function.name);
        let abort = tracker.start(
            &call.id,
            &call.function.name,
            agent_name,
            &call.function.arguments,
        );
        let exec = run_call(call.clone(), tool, abort).await;
        tracker.finish(
            &call.id,
            if exec.is_error {
                RunningToolStatus::Failed
            } else {
                RunningToolStatus::Completed
            },
        );
        exec
    }
}

async fn run_call(
    call: ToolCallData,
    tool: Option<Arc<dyn Tool>>,
    abort: tokio_util::sync::CancellationToken,
) -> ToolExecution {
    let schema = tool.as_ref().map(|t| t.schema());
    let args = match validate_call(&call, schema.as_ref()) {
        Ok(args) => args,
        Err(e) => {
            warn!(tool = %call.function.name, call_id = %call.id, error = %e, "tool call rejected");
            return ToolExecution {
                output: e.to_output(),
                call,
                is_error: true,
            };
        }
    };

    // Resolution succeeded if validation passed.
    let tool = tool.expect("validated calls resolve");
    match tool.execute(args, abort).await {
        Ok(output) => ToolExecution {
            call,
            output,
            is_error: false,
        },
        Err(e) => ToolExecution {
            call,
            output: serde_json::json!({ "error": e.to_string() }).to_string(),
            is_error: true,
        },
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
