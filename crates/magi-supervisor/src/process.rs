//! Task process records and the process-wide tracker.
//!
//! Lifecycle: started → running → (waiting ↔ running) → completed | failed
//! | terminated.  Terminal states absorb; `observe` bumps the progress
//! timestamp the health sweep reads.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Started,
    Running,
    Waiting,
    Completed,
    Failed,
    Terminated,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub process_id: String,
    pub started: DateTime<Utc>,
    pub status: ProcessStatus,
    /// Worker kind executing the task (e.g. "task", "research", "code").
    pub tool: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_observed_at: DateTime<Utc>,
}

impl Process {
    pub fn new(
        process_id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        tool: impl Into<String>,
        project_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id: process_id.into(),
            started: now,
            status: ProcessStatus::Started,
            tool: tool.into(),
            name: name.into(),
            command: command.into(),
            project_ids,
            output: None,
            error: None,
            last_observed_at: now,
        }
    }
}

/// Mint a task identity: `AI-` followed by six alphanumerics.
pub fn mint_process_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("AI-{suffix}")
}

#[derive(Default)]
pub struct ProcessTracker {
    inner: Mutex<HashMap<String, Process>>,
    core_process_id: Mutex<Option<String>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_core_process_id(&self, id: impl Into<String>) {
        *self.core_process_id.lock().unwrap() = Some(id.into());
    }

    pub fn core_process_id(&self) -> Option<String> {
        self.core_process_id.lock().unwrap().clone()
    }

    pub fn register(&self, process: Process) {
        self.inner
            .lock()
            .unwrap()
            .insert(process.process_id.clone(), process);
    }

    pub fn get(&self, id: &str) -> Option<Process> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    /// Active (non-terminal) processes, oldest first.
    pub fn active(&self) -> Vec<Process> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Process> = inner
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.started);
        out
    }

    pub fn list(&self) -> Vec<Process> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Process> = inner.values().cloned().collect();
        out.sort_by_key(|p| p.started);
        out
    }

    /// Apply a status transition.  Terminal records never change again; a
    /// `started` record moves to `running` on its first progress signal.
    /// Returns the stored status afterwards, or `None` for unknown ids.
    pub fn update_status(&self, id: &str, status: ProcessStatus) -> Option<ProcessStatus> {
        let mut inner = self.inner.lock().unwrap();
        let process = inner.get_mut(id)?;
        if !process.status.is_terminal() {
            process.status = status;
            process.last_observed_at = Utc::now();
        }
        Some(process.status)
    }

    /// Record a progress observation without changing terminal state.
    pub fn observe(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(process) = inner.get_mut(id) {
            process.last_observed_at = Utc::now();
            if process.status == ProcessStatus::Started {
                process.status = ProcessStatus::Running;
            }
        }
    }

    pub fn record_output(&self, id: &str, output: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(process) = inner.get_mut(id) {
            process.output = Some(output.into());
            process.last_observed_at = Utc::now();
        }
    }

    pub fn record_error(&self, id: &str, error: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(process) = inner.get_mut(id) {
            process.error = Some(error.into());
            process.last_observed_at = Utc::now();
        }
    }

    /// Ids of non-terminal tasks with no observed progress for `stall`.
    pub fn stalled(&self, stall: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - stall;
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<String> = inner
            .values()
            .filter(|p| !p.status.is_terminal() && p.last_observed_at < cutoff)
            .map(|p| p.process_id.clone())
            .collect();
        out.sort();
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
