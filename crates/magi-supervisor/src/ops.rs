//! Overseer-facing task operations and controller message handling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::info;

use magi_comm::{CommClient, ControllerMessage, ProcessEvent};
use magi_core::PauseController;
use magi_model::Message;
use magi_tools::RunningToolTracker;

use crate::{
    process::{mint_process_id, Process, ProcessStatus, ProcessTracker},
    pty::{apply_system_command, PtyBus},
    wait,
};

/// Most project ids one task may reference.
const MAX_PROJECTS_PER_TASK: usize = 3;

pub struct TaskSupervisor {
    tracker: Arc<ProcessTracker>,
    running_tools: Arc<RunningToolTracker>,
    pause: PauseController,
    client: CommClient,
    pty: Arc<dyn PtyBus>,
    known_projects: Mutex<HashSet<String>>,
    stall: chrono::Duration,
}

impl TaskSupervisor {
    pub fn new(
        tracker: Arc<ProcessTracker>,
        running_tools: Arc<RunningToolTracker>,
        pause: PauseController,
        client: CommClient,
        pty: Arc<dyn PtyBus>,
        stall_secs: u64,
    ) -> Self {
        Self {
            tracker,
            running_tools,
            pause,
            client,
            pty,
            known_projects: Mutex::new(HashSet::new()),
            stall: chrono::Duration::seconds(stall_secs as i64),
        }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn add_known_project(&self, id: impl Into<String>) {
        self.known_projects.lock().unwrap().insert(id.into());
    }

    /// Create a task: validate projects, mint an id, register the record,
    /// and announce `process_start` to the controller (which launches the
    /// worker).  Returns the new task id.
    #[allow(clippy::too_many_arguments)]
    pub fn start_task(
        &self,
        name: &str,
        task: &str,
        context: &str,
        warnings: &str,
        goal: &str,
        task_type: &str,
        project_ids: Vec<String>,
    ) -> anyhow::Result<String> {
        let unique: HashSet<&String> = project_ids.iter().collect();
        if unique.len() != project_ids.len() {
            bail!("duplicate project ids");
        }
        if project_ids.len() > MAX_PROJECTS_PER_TASK {
            bail!("at most {MAX_PROJECTS_PER_TASK} projects per task");
        }
        {
            let known = self.known_projects.lock().unwrap();
            for id in &project_ids {
                if !known.contains(id) {
                    bail!("unknown project id: {id}");
                }
            }
        }

        let process_id = mint_process_id();
        let command = format!(
            "Task: {task}\n\nContext: {context}\n\nWarnings: {warnings}\n\nGoal: {goal}"
        );
        self.tracker.register(Process::new(
            &process_id,
            name,
            &command,
            task_type,
            project_ids.clone(),
        ));
        info!(task_id = %process_id, name, task_type, "task registered");
        self.client.send(ProcessEvent::ProcessStart {
            process_id: process_id.clone(),
            name: name.to_string(),
            command,
            tool: task_type.to_string(),
            project_ids,
        });
        Ok(process_id)
    }

    /// Inject guidance into a running task.  `"stop"` is the terminate
    /// shortcut; the controller routes the command either way.
    pub fn send_message(&self, task_id: &str, text: &str) -> anyhow::Result<String> {
        if !self.tracker.contains(task_id) {
            bail!("unknown task: {task_id}");
        }
        self.client.send(ProcessEvent::CommandStart {
            target_process_id: task_id.to_string(),
            command: text.to_string(),
        });
        Ok(if text == "stop" {
            format!("Requested termination of task {task_id}")
        } else {
            format!("Message sent to task {task_id}")
        })
    }

    /// Render a task's state for the overseer.
    pub fn get_task_status(&self, task_id: &str, detailed: bool) -> anyhow::Result<String> {
        let Some(process) = self.tracker.get(task_id) else {
            bail!("unknown task: {task_id}");
        };
        let mut out = format!(
            "{} [{}] status={} started={} last_observed={}",
            process.process_id,
            process.name,
            process.status.as_str(),
            process.started.to_rfc3339(),
            process.last_observed_at.to_rfc3339(),
        );
        if let Some(output) = &process.output {
            let tail: String = output.chars().rev().take(400).collect::<Vec<_>>().into_iter().rev().collect();
            out.push_str(&format!("\noutput: {tail}"));
        }
        if let Some(error) = &process.error {
            out.push_str(&format!("\nerror: {error}"));
        }
        if detailed {
            out.push_str(&format!("\ncommand:\n{}", process.command));
            if !process.project_ids.is_empty() {
                out.push_str(&format!("\nprojects: {}", process.project_ids.join(", ")));
            }
        }
        Ok(out)
    }

    /// Ids of tasks with no observed progress inside the stall window and a
    /// non-terminal status.  Reported only — never auto-terminated.
    pub fn check_all_task_health(&self) -> Vec<String> {
        self.tracker.stalled(self.stall)
    }

    pub async fn wait_for_running_task(&self, task_id: &str, timeout_secs: u64) -> String {
        wait::wait_for_running_task(
            &self.tracker,
            &self.running_tools,
            &self.client,
            task_id,
            timeout_secs,
        )
        .await
    }

    /// Handle one controller → engine message.  Returns messages to append
    /// to the overseer history (project updates and system messages become
    /// visible turns).
    pub fn handle_controller_message(&self, message: ControllerMessage) -> Vec<Message> {
        match message {
            ControllerMessage::Connect {
                core_process_id, ..
            } => {
                self.tracker.set_core_process_id(core_process_id);
                vec![]
            }
            ControllerMessage::ProcessEvent { process_id, event } => {
                self.apply_process_event(&process_id, event)
            }
            ControllerMessage::ProjectUpdate {
                project_id,
                failed,
                message,
            } => {
                if failed {
                    vec![Message::developer(format!(
                        "Creating project {project_id} failed: {message}"
                    ))]
                } else {
                    self.add_known_project(&project_id);
                    vec![Message::developer(format!(
                        "Project {project_id}: {message}"
                    ))]
                }
            }
            ControllerMessage::SystemMessage { message } => {
                vec![Message::developer(format!("[system] {message}"))]
            }
            ControllerMessage::SystemCommand { command } => {
                apply_system_command(command, &self.pause, &self.running_tools, &*self.pty);
                vec![]
            }
        }
    }

    fn apply_process_event(&self, process_id: &str, event: ProcessEvent) -> Vec<Message> {
        match event {
            ProcessEvent::ProcessRunning { .. } => {
                self.tracker.update_status(process_id, ProcessStatus::Running);
                vec![]
            }
            ProcessEvent::ProcessDone { output, .. } => {
                self.tracker.record_output(process_id, &output);
                self.tracker
                    .update_status(process_id, ProcessStatus::Completed);
                vec![Message::developer(format!(
                    "Task {process_id} completed: {output}"
                ))]
            }
            ProcessEvent::ProcessFailed { error, .. } => {
                self.tracker.record_error(process_id, &error);
                self.tracker.update_status(process_id, ProcessStatus::Failed);
                vec![Message::developer(format!(
                    "Task {process_id} failed: {error}"
                ))]
            }
            ProcessEvent::ProcessTerminated { .. } => {
                self.tracker
                    .update_status(process_id, ProcessStatus::Terminated);
                vec![Message::developer(format!("Task {process_id} terminated"))]
            }
            ProcessEvent::SystemUpdate { message } => {
                self.tracker.observe(process_id);
                vec![Message::developer(format!(
                    "[{process_id}] {message}"
                ))]
            }
            // Everything else is progress evidence for the health sweep.
            _ => {
                self.tracker.observe(process_id);
                vec![]
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::RecordingPtyBus;
    use magi_comm::{CommClientConfig, SystemCommand};

    fn supervisor() -> TaskSupervisor {
        let mut config = CommClientConfig::new("AI-core01", "127.0.0.1", 1);
        config.test_mode = true;
        let (client, _inbound) = CommClient::start(config, None);
        TaskSupervisor::new(
            Arc::new(ProcessTracker::new()),
            Arc::new(RunningToolTracker::new()),
            PauseController::new(),
            client,
            Arc::new(RecordingPtyBus::new()),
            300,
        )
    }

    #[tokio::test]
    async fn start_task_mints_id_and_registers() {
        let sup = supervisor();
        let id = sup
            .start_task("analyze", "analyze the logs", "ctx", "none", "done", "task", vec![])
            .unwrap();
        assert!(id.starts_with("AI-"));
        let process = sup.tracker().get(&id).unwrap();
        assert_eq!(process.status, ProcessStatus::Started);
        assert!(process.command.contains("analyze the logs"));
    }

    #[tokio::test]
    async fn start_task_rejects_unknown_project() {
        let sup = supervisor();
        let err = sup
            .start_task("n", "t", "c", "w", "g", "task", vec!["proj-x".into()])
            .unwrap_err();
        assert!(err.to_string().contains("unknown project"));
    }

    #[tokio::test]
    async fn start_task_accepts_up_to_three_known_projects() {
        let sup = supervisor();
        for id in ["p1", "p2", "p3", "p4"] {
            sup.add_known_project(id);
        }
        assert!(sup
            .start_task(
                "n", "t", "c", "w", "g", "task",
                vec!["p1".into(), "p2".into(), "p3".into()]
            )
            .is_ok());
        let err = sup
            .start_task(
                "n", "t", "c", "w", "g", "task",
                vec!["p1".into(), "p2".into(), "p3".into(), "p4".into()]
            )
            .unwrap_err();
        assert!(err.to_string().contains("at most 3"));
    }

    #[tokio::test]
    async fn start_task_rejects_duplicate_projects() {
        let sup = supervisor();
        sup.add_known_project("p1");
        let err = sup
            .start_task("n", "t", "c", "w", "g", "task", vec!["p1".into(), "p1".into()])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn send_message_requires_known_task() {
        let sup = supervisor();
        assert!(sup.send_message("AI-nope00", "hello").is_err());
        let id = sup
            .start_task("n", "t", "c", "w", "g", "task", vec![])
            .unwrap();
        let reply = sup.send_message(&id, "stop").unwrap();
        assert!(reply.contains("termination"));
    }

    #[tokio::test]
    async fn task_status_summary_and_detail() {
        let sup = supervisor();
        let id = sup
            .start_task("builder", "build it", "c", "w", "g", "task", vec![])
            .unwrap();
        let summary = sup.get_task_status(&id, false).unwrap();
        assert!(summary.contains("builder"));
        assert!(!summary.contains("Task: build it"));
        let detail = sup.get_task_status(&id, true).unwrap();
        assert!(detail.contains("Task: build it"));
    }

    #[tokio::test]
    async fn process_events_drive_lifecycle() {
        let sup = supervisor();
        let id = sup
            .start_task("n", "t", "c", "w", "g", "task", vec![])
            .unwrap();

        sup.handle_controller_message(ControllerMessage::ProcessEvent {
            process_id: id.clone(),
            event: ProcessEvent::ProcessRunning {
                process_id: id.clone(),
            },
        });
        assert_eq!(
            sup.tracker().get(&id).unwrap().status,
            ProcessStatus::Running
        );

        let msgs = sup.handle_controller_message(ControllerMessage::ProcessEvent {
            process_id: id.clone(),
            event: ProcessEvent::ProcessDone {
                process_id: id.clone(),
                output: "report ready".into(),
            },
        });
        assert_eq!(
            sup.tracker().get(&id).unwrap().status,
            ProcessStatus::Completed
        );
        assert!(msgs[0]
            .content
            .as_deref()
            .unwrap()
            .contains("report ready"));
    }

    #[tokio::test]
    async fn project_update_failure_becomes_developer_message() {
        let sup = supervisor();
        let msgs = sup.handle_controller_message(ControllerMessage::ProjectUpdate {
            project_id: "proj-1".into(),
            failed: true,
            message: "disk full".into(),
        });
        assert!(msgs[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Creating project proj-1 failed"));
        // Failed projects are not registered as known.
        assert!(sup
            .start_task("n", "t", "c", "w", "g", "task", vec!["proj-1".into()])
            .is_err());
    }

    #[tokio::test]
    async fn successful_project_update_registers_project() {
        let sup = supervisor();
        sup.handle_controller_message(ControllerMessage::ProjectUpdate {
            project_id: "proj-2".into(),
            failed: false,
            message: "created".into(),
        });
        assert!(sup
            .start_task("n", "t", "c", "w", "g", "task", vec!["proj-2".into()])
            .is_ok());
    }

    #[tokio::test]
    async fn pause_command_reaches_pause_controller() {
        let mut config = CommClientConfig::new("AI-core02", "127.0.0.1", 1);
        config.test_mode = true;
        let (client, _inbound) = CommClient::start(config, None);
        let pause = PauseController::new();
        let sup = TaskSupervisor::new(
            Arc::new(ProcessTracker::new()),
            Arc::new(RunningToolTracker::new()),
            pause.clone(),
            client,
            Arc::new(RecordingPtyBus::new()),
            300,
        );
        sup.handle_controller_message(ControllerMessage::SystemCommand {
            command: SystemCommand::Pause,
        });
        assert!(pause.is_paused());
    }

    #[tokio::test]
    async fn connect_stores_core_process_id() {
        let sup = supervisor();
        sup.handle_controller_message(ControllerMessage::Connect {
            controller_port: 3010,
            core_process_id: "AI-core99".into(),
        });
        assert_eq!(
            sup.tracker().core_process_id().as_deref(),
            Some("AI-core99")
        );
    }
}
