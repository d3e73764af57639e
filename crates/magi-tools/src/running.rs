//! Process-wide registry of in-flight tool invocations.
//!
//! Every dispatched tool call gets a `RunningTool` record with an abort
//! token.  The registry backs `wait_for_running_tool` and system-wide
//! interrupts: pause, resume, and fresh human input abort every running
//! wait so the overseer reacts immediately instead of at the next poll.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tool names whose only job is to block; these are the interrupt targets.
pub const WAITING_TOOL_NAMES: &[&str] = &["wait_for_running_task", "wait_for_running_tool"];

/// Longest argument preview stored on a record.
const ARGS_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningToolStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunningToolStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct RunningTool {
    pub id: String,
    pub tool_name: String,
    pub agent_name: String,
    pub args_preview: String,
    pub started_at: DateTime<Utc>,
    pub status: RunningToolStatus,
    cancel: CancellationToken,
}

impl RunningTool {
    /// Signal the executor and the tool's own abort token.  Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Default)]
pub struct RunningToolTracker {
    inner: Mutex<HashMap<String, RunningTool>>,
}

impl RunningToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched call and hand back its abort token.
    pub fn start(
        &self,
        id: impl Into<String>,
        tool_name: impl Into<String>,
        agent_name: impl Into<String>,
        args: &str,
    ) -> CancellationToken {
        let id = id.into();
        let cancel = CancellationToken::new();
        let mut preview: String = args.chars().take(ARGS_PREVIEW_CHARS).collect();
        if args.chars().count() > ARGS_PREVIEW_CHARS {
            preview.push('…');
        }
        let record = RunningTool {
            id: id.clone(),
            tool_name: tool_name.into(),
            agent_name: agent_name.into(),
            args_preview: preview,
            started_at: Utc::now(),
            status: RunningToolStatus::Running,
            cancel: cancel.clone(),
        };
        debug!(tool = %record.tool_name, call_id = %id, "running tool registered");
        self.inner.lock().unwrap().insert(id, record);
        cancel
    }

    /// Move a record to a terminal status.  Aborted records stay aborted.
    pub fn finish(&self, id: &str, status: RunningToolStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(id) {
            if record.status == RunningToolStatus::Running {
                record.status = status;
            }
        }
    }

    /// Abort one call by id.  Returns false when the id is unknown or
    /// already terminal.
    pub fn abort(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(id) {
            Some(record) if record.status == RunningToolStatus::Running => {
                record.status = RunningToolStatus::Aborted;
                record.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Abort every running wait-tool.  Used on pause, resume, and fresh
    /// human input.  Returns the ids that were interrupted.
    pub fn interrupt_waiting(&self, reason: &str) -> Vec<String> {
        let mut interrupted = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for record in inner.values_mut() {
            if record.status == RunningToolStatus::Running
                && WAITING_TOOL_NAMES.contains(&record.tool_name.as_str())
            {
                record.status = RunningToolStatus::Aborted;
                record.cancel.cancel();
                interrupted.push(record.id.clone());
            }
        }
        if !interrupted.is_empty() {
            info!(reason, count = interrupted.len(), "interrupted waiting tools");
        }
        interrupted
    }

    pub fn get(&self, id: &str) -> Option<RunningTool> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Snapshot of records still running.
    pub fn running(&self) -> Vec<RunningTool> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RunningTool> = inner
            .values()
            .filter(|r| r.status == RunningToolStatus::Running)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.started_at);
        out
    }

    /// Drop terminal records, keeping the registry bounded.
    pub fn prune_finished(&self) {
        self.inner
            .lock()
            .unwrap()
            .retain(|_, r| r.status == RunningToolStatus::Running);
    }

    /// Block until the referenced tool reaches a terminal status.
    ///
    /// Polls at 1 s ticks; reacts to `abort` immediately.  The wait itself
    /// is registered under the name `wait_for_running_tool` so system-wide
    /// interrupts cover it.
    pub async fn wait_for(&self, target_id: &str, timeout_secs: u64) -> String {
        let wait_id = format!("wait_{}", uuid::Uuid::new_v4().simple());
        let abort = self.start(
            &wait_id,
            "wait_for_running_tool",
            "system",
            &format!(r#"{{"tool_id":"{target_id}"}}"#),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            match self.get(target_id) {
                None => {
                    self.finish(&wait_id, RunningToolStatus::Completed);
                    return format!("Tool {target_id} is not registered");
                }
                Some(record) if record.status.is_terminal() => {
                    self.finish(&wait_id, RunningToolStatus::Completed);
                    return format!(
                        "Tool {target_id} ({}) finished with status {:?}",
                        record.tool_name, record.status
                    );
                }
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                self.finish(&wait_id, RunningToolStatus::Completed);
                return format!("Tool {target_id} did not complete within {timeout_secs} seconds");
            }
            tokio::select! {
                _ = abort.cancelled() => {
                    self.finish(&wait_id, RunningToolStatus::Aborted);
                    return format!("Wait for tool {target_id} was aborted");
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
