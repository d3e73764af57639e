//! Cooperative task waiting with heartbeats.

use std::time::Duration;

use magi_comm::{CommClient, ProcessEvent};
use magi_tools::{RunningToolStatus, RunningToolTracker};

use crate::process::ProcessTracker;

/// Seconds between heartbeat events while a wait blocks.
const HEARTBEAT_SECS: u64 = 60;

/// Poll a task until it reaches a terminal status.
///
/// Polls at 1 s ticks and emits a `task_waiting { elapsed_seconds }`
/// heartbeat every 60 s.  Returns immediately on terminal status, on abort
/// (the wait is registered in the running-tool tracker, so system-wide
/// interrupts reach it), or at `timeout_secs`.  A `task_wait_complete`
/// event with the final status closes every outcome.
pub async fn wait_for_running_task(
    tracker: &ProcessTracker,
    running_tools: &RunningToolTracker,
    client: &CommClient,
    task_id: &str,
    timeout_secs: u64,
) -> String {
    let wait_id = format!("wait_{}", uuid_suffix());
    let abort = running_tools.start(
        &wait_id,
        "wait_for_running_task",
        "overseer",
        &format!(r#"{{"task_id":"{task_id}","timeout":{timeout_secs}}}"#),
    );

    let started = tokio::time::Instant::now();
    let mut elapsed_secs = 0u64;

    let finish = |wait_status: RunningToolStatus, final_status: &str, message: String| {
        running_tools.finish(&wait_id, wait_status);
        client.send(ProcessEvent::TaskWaitComplete {
            task_id: task_id.to_string(),
            final_status: final_status.to_string(),
        });
        message
    };

    loop {
        match tracker.get(task_id) {
            None => {
                return finish(
                    RunningToolStatus::Completed,
                    "unknown",
                    format!("Task {task_id} is not registered"),
                );
            }
            Some(process) if process.status.is_terminal() => {
                let message = match process.status {
                    crate::ProcessStatus::Completed => format!(
                        "Task {task_id} completed: {}",
                        process.output.as_deref().unwrap_or("(no output)")
                    ),
                    crate::ProcessStatus::Failed => format!(
                        "Task {task_id} failed: {}",
                        process.error.as_deref().unwrap_or("(no error detail)")
                    ),
                    _ => format!("Task {task_id} was terminated"),
                };
                return finish(
                    RunningToolStatus::Completed,
                    process.status.as_str(),
                    message,
                );
            }
            Some(_) => {}
        }

        if elapsed_secs >= timeout_secs {
            let last_status = tracker
                .get(task_id)
                .map(|p| p.status.as_str())
                .unwrap_or("unknown");
            return finish(
                RunningToolStatus::Completed,
                last_status,
                format!(
                    "Task {task_id} did not complete within {timeout_secs} seconds; \
                     last status={last_status}"
                ),
            );
        }

        tokio::select! {
            _ = abort.cancelled() => {
                let last_status = tracker
                    .get(task_id)
                    .map(|p| p.status.as_str())
                    .unwrap_or("unknown");
                return finish(
                    RunningToolStatus::Aborted,
                    last_status,
                    format!("Wait for task {task_id} was aborted"),
                );
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                elapsed_secs = started.elapsed().as_secs();
                if elapsed_secs > 0 && elapsed_secs % HEARTBEAT_SECS == 0 {
                    client.send(ProcessEvent::TaskWaiting {
                        task_id: task_id.to_string(),
                        elapsed_seconds: elapsed_secs,
                    });
                }
            }
        }
    }
}

fn uuid_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let n = rng.gen_range(0..36);
            char::from_digit(n, 36).unwrap_or('0')
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Process, ProcessStatus};
    use magi_comm::CommClientConfig;

    fn test_client() -> CommClient {
        let mut config = CommClientConfig::new("AI-wait00", "127.0.0.1", 1);
        config.test_mode = true;
        CommClient::start(config, None).0
    }

    fn tracker_with(id: &str) -> ProcessTracker {
        let tracker = ProcessTracker::new();
        tracker.register(Process::new(id, "t", "cmd", "task", vec![]));
        tracker
    }

    #[tokio::test(start_paused = true)]
    async fn returns_promptly_on_completion() {
        let tracker = tracker_with("AI-t1");
        let running = RunningToolTracker::new();
        let client = test_client();

        tracker.update_status("AI-t1", ProcessStatus::Completed);
        tracker.record_output("AI-t1", "all done");
        let msg = wait_for_running_task(&tracker, &running, &client, "AI-t1", 30).await;
        assert!(msg.contains("completed"));
        assert!(msg.contains("all done"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_last_status() {
        let tracker = tracker_with("AI-t1");
        tracker.update_status("AI-t1", ProcessStatus::Running);
        let running = RunningToolTracker::new();
        let client = test_client();

        let msg = wait_for_running_task(&tracker, &running, &client, "AI-t1", 5).await;
        assert!(msg.contains("did not complete within 5 seconds"));
        assert!(msg.contains("last status=running"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_via_interrupt_returns_aborted() {
        let tracker = std::sync::Arc::new(tracker_with("AI-t1"));
        let running = std::sync::Arc::new(RunningToolTracker::new());
        let client = test_client();

        let t = std::sync::Arc::clone(&tracker);
        let r = std::sync::Arc::clone(&running);
        let waiter = tokio::spawn(async move {
            wait_for_running_task(&t, &r, &test_client(), "AI-t1", 600).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.interrupt_waiting("fresh input");
        let msg = waiter.await.unwrap();
        assert!(msg.contains("aborted"));
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_task_returns_immediately() {
        let tracker = ProcessTracker::new();
        let running = RunningToolTracker::new();
        let client = test_client();
        let msg = wait_for_running_task(&tracker, &running, &client, "AI-nope", 30).await;
        assert!(msg.contains("not registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_reports_error() {
        let tracker = tracker_with("AI-t1");
        tracker.record_error("AI-t1", "worker crashed");
        tracker.update_status("AI-t1", ProcessStatus::Failed);
        let running = RunningToolTracker::new();
        let client = test_client();
        let msg = wait_for_running_task(&tracker, &running, &client, "AI-t1", 30).await;
        assert!(msg.contains("failed"));
        assert!(msg.contains("worker crashed"));
    }
}
