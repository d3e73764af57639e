//! System-status rendering: the developer message injected before every
//! monologue turn.

use chrono::{DateTime, Utc};

use magi_supervisor::Process;
use magi_tools::RunningTool;

use crate::memory::MemoryEntry;

pub struct StatusInputs<'a> {
    pub started_at: DateTime<Utc>,
    pub thought_delay_secs: u64,
    pub active_projects: &'a [String],
    pub active_tasks: &'a [Process],
    pub running_tools: &'a [RunningTool],
    pub short_term_memories: &'a [MemoryEntry],
}

pub fn render_system_status(inputs: &StatusInputs<'_>) -> String {
    let now = Utc::now();
    let uptime = now.signed_duration_since(inputs.started_at);
    let mut out = String::from("=== System Status ===\n");
    out.push_str(&format!("Current time: {}\n", now.to_rfc3339()));
    out.push_str(&format!(
        "Time running: {}h {}m {}s\n",
        uptime.num_hours(),
        uptime.num_minutes() % 60,
        uptime.num_seconds() % 60
    ));
    out.push_str(&format!(
        "Thought delay: {}s\n",
        inputs.thought_delay_secs
    ));

    if inputs.active_projects.is_empty() {
        out.push_str("Active projects: none\n");
    } else {
        out.push_str(&format!(
            "Active projects: {}\n",
            inputs.active_projects.join(", ")
        ));
    }

    if inputs.active_tasks.is_empty() {
        out.push_str("Active tasks: none\n");
    } else {
        out.push_str("Active tasks:\n");
        for task in inputs.active_tasks {
            out.push_str(&format!(
                "  - {} [{}] {}\n",
                task.process_id,
                task.name,
                task.status.as_str()
            ));
        }
    }

    if inputs.running_tools.is_empty() {
        out.push_str("Running tools: none\n");
    } else {
        out.push_str("Running tools:\n");
        for tool in inputs.running_tools {
            out.push_str(&format!(
                "  - {} ({}) args: {}\n",
                tool.tool_name, tool.agent_name, tool.args_preview
            ));
        }
    }

    if inputs.short_term_memories.is_empty() {
        out.push_str("Short-term memories: none");
    } else {
        out.push_str("Short-term memories:\n");
        for entry in inputs.short_term_memories {
            out.push_str(&format!("  - [{}] {}\n", entry.id, entry.memory));
        }
        out.pop();
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mentions_every_section() {
        let inputs = StatusInputs {
            started_at: Utc::now() - chrono::Duration::minutes(90),
            thought_delay_secs: 8,
            active_projects: &["proj-1".into()],
            active_tasks: &[Process::new("AI-abc123", "research", "cmd", "task", vec![])],
            running_tools: &[],
            short_term_memories: &[],
        };
        let status = render_system_status(&inputs);
        assert!(status.contains("Current time:"));
        assert!(status.contains("Time running: 1h 30m"));
        assert!(status.contains("Thought delay: 8s"));
        assert!(status.contains("proj-1"));
        assert!(status.contains("AI-abc123"));
        assert!(status.contains("Running tools: none"));
        assert!(status.contains("Short-term memories: none"));
    }
}
