//! The controller process: accepts engine sockets, relays events to the
//! browser UI, routes commands between engines, and launches task workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use magi_comm::{ControllerMessage, EngineEvent, EngineFrame, ProcessEvent};
use magi_config::Config;
use magi_model::StreamEvent;

use crate::{
    colors::colors_for,
    ui::{UiCommand, UiEvent},
};

#[derive(Debug, Clone)]
struct ProcessRow {
    command: String,
    status: String,
}

pub struct Controller {
    config: Arc<Config>,
    core_process_id: String,
    /// Connected engines, keyed by process id.
    engines: Mutex<HashMap<String, mpsc::UnboundedSender<ControllerMessage>>>,
    /// Launched worker children, for termination.
    children: tokio::sync::Mutex<HashMap<String, tokio::process::Child>>,
    processes: Mutex<HashMap<String, ProcessRow>>,
    ui_tx: broadcast::Sender<UiEvent>,
    /// Disabled in tests: no child processes are spawned.
    spawn_workers: bool,
}

pub type SharedController = Arc<Controller>;

impl Controller {
    pub fn new(config: Arc<Config>, core_process_id: impl Into<String>) -> SharedController {
        let (ui_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            core_process_id: core_process_id.into(),
            engines: Mutex::new(HashMap::new()),
            children: tokio::sync::Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            ui_tx,
            spawn_workers: true,
        })
    }

    pub fn new_without_workers(
        config: Arc<Config>,
        core_process_id: impl Into<String>,
    ) -> SharedController {
        let (ui_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            core_process_id: core_process_id.into(),
            engines: Mutex::new(HashMap::new()),
            children: tokio::sync::Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            ui_tx,
            spawn_workers: false,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        let output_dir = self.config.engine.output_dir.clone();
        Router::new()
            .route("/ws/engine/:process_id", get(engine_ws_handler))
            .route("/ws", get(ui_ws_handler))
            .nest_service("/output", tower_http::services::ServeDir::new(output_dir))
            .with_state(self)
    }

    pub async fn serve(
        self: SharedController,
        listener: tokio::net::TcpListener,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "controller listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn ui_broadcast(&self, event: UiEvent) {
        let _ = self.ui_tx.send(event);
    }

    fn send_to_engine(&self, process_id: &str, message: ControllerMessage) {
        let engines = self.engines.lock().unwrap();
        match engines.get(process_id) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(process_id, "no connected engine for message"),
        }
    }

    fn forward_to_core(&self, process_id: &str, event: ProcessEvent) {
        if process_id == self.core_process_id {
            return;
        }
        self.send_to_engine(
            &self.core_process_id.clone(),
            ControllerMessage::ProcessEvent {
                process_id: process_id.to_string(),
                event,
            },
        );
    }

    fn set_status(&self, process_id: &str, status: &str) {
        let mut processes = self.processes.lock().unwrap();
        if let Some(row) = processes.get_mut(process_id) {
            row.status = status.to_string();
        }
        drop(processes);
        self.ui_broadcast(UiEvent::ProcessUpdate {
            id: process_id.to_string(),
            status: status.to_string(),
        });
    }

    pub fn process_status(&self, process_id: &str) -> Option<String> {
        self.processes
            .lock()
            .unwrap()
            .get(process_id)
            .map(|r| r.status.clone())
    }

    /// Apply one engine frame: registry updates, UI relay, peer routing.
    pub async fn handle_engine_frame(&self, frame: EngineFrame) {
        let source = frame.process_id.clone();
        match frame.event {
            EngineEvent::Process(event) => self.handle_process_event(&source, event).await,
            EngineEvent::Stream(event) => self.handle_stream_event(&source, event),
        }
    }

    async fn handle_process_event(&self, source: &str, event: ProcessEvent) {
        match event {
            ProcessEvent::ProcessStart {
                process_id,
                name,
                command,
                tool,
                ..
            } => {
                self.processes.lock().unwrap().insert(
                    process_id.clone(),
                    ProcessRow {
                        command: command.clone(),
                        status: "started".into(),
                    },
                );
                // The replay path reads ProcessRow.command; emit the same
                // field here so late-joining clients see identical data.
                self.ui_broadcast(UiEvent::ProcessCreate {
                    id: process_id.clone(),
                    command: command.clone(),
                    status: "started".into(),
                    colors: colors_for(&process_id),
                });
                info!(task_id = %process_id, name = %name, tool = %tool, "task created");
                if self.spawn_workers {
                    self.spawn_worker(&process_id, &command).await;
                }
            }
            ProcessEvent::CommandStart {
                target_process_id,
                command,
            } => {
                if command == "stop" {
                    self.terminate(&target_process_id).await;
                } else {
                    self.send_to_engine(
                        &target_process_id,
                        ControllerMessage::SystemMessage { message: command },
                    );
                }
            }
            ProcessEvent::ProcessRunning { ref process_id } => {
                self.set_status(process_id, "running");
                self.forward_to_core(source, event.clone());
            }
            ProcessEvent::ProcessDone { ref process_id, .. } => {
                self.set_status(process_id, "completed");
                self.forward_to_core(source, event.clone());
            }
            ProcessEvent::ProcessFailed { ref process_id, .. } => {
                self.set_status(process_id, "failed");
                self.forward_to_core(source, event.clone());
            }
            ProcessEvent::ProcessTerminated { ref process_id } => {
                self.set_status(process_id, "terminated");
                self.forward_to_core(source, event.clone());
            }
            ProcessEvent::Talk { ref message, .. } => {
                self.ui_broadcast(UiEvent::ProcessLogs {
                    id: source.to_string(),
                    logs: message.clone(),
                });
            }
            ProcessEvent::SystemUpdate { .. }
            | ProcessEvent::TaskWaiting { .. }
            | ProcessEvent::TaskWaitComplete { .. } => {
                self.forward_to_core(source, event);
            }
            ProcessEvent::Console { data } => {
                self.ui_broadcast(UiEvent::ProcessLogs {
                    id: source.to_string(),
                    logs: data,
                });
            }
        }
    }

    fn handle_stream_event(&self, source: &str, event: StreamEvent) {
        match event {
            StreamEvent::MessageDelta { delta, .. } => {
                self.ui_broadcast(UiEvent::ProcessLogs {
                    id: source.to_string(),
                    logs: delta,
                });
            }
            StreamEvent::Error { error, .. } => {
                self.ui_broadcast(UiEvent::ProcessLogs {
                    id: source.to_string(),
                    logs: format!("[error] {error}"),
                });
            }
            _ => {}
        }
    }

    async fn spawn_worker(&self, process_id: &str, command: &str) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!("cannot resolve engine binary: {e}");
                return;
            }
        };
        let spawned = tokio::process::Command::new(exe)
            .arg("engine")
            .arg("--process-id")
            .arg(process_id)
            .arg("--controller-port")
            .arg(self.config.controller.port.to_string())
            .arg("--task-prompt")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                self.children
                    .lock()
                    .await
                    .insert(process_id.to_string(), child);
            }
            Err(e) => {
                warn!(task_id = %process_id, "failed to launch worker: {e}");
                self.set_status(process_id, "failed");
            }
        }
    }

    pub async fn terminate(&self, process_id: &str) {
        if let Some(mut child) = self.children.lock().await.remove(process_id) {
            let _ = child.kill().await;
        }
        self.set_status(process_id, "terminated");
        self.forward_to_core(
            process_id,
            ProcessEvent::ProcessTerminated {
                process_id: process_id.to_string(),
            },
        );
    }

    pub async fn handle_ui_command(&self, command: UiCommand) {
        match command {
            UiCommand::CommandRun { command } => {
                let message = format!("{} said: {}", self.config.overseer.user_name, command);
                self.send_to_engine(
                    &self.core_process_id.clone(),
                    ControllerMessage::SystemMessage { message },
                );
            }
            UiCommand::ProcessCommand {
                process_id,
                command,
            } => {
                if command == "stop" {
                    self.terminate(&process_id).await;
                } else {
                    self.send_to_engine(
                        &process_id,
                        ControllerMessage::SystemMessage { message: command },
                    );
                }
            }
            UiCommand::ProcessTerminate { process_id } => {
                self.terminate(&process_id).await;
            }
            UiCommand::AudioStreamStart | UiCommand::AudioStreamData { .. } | UiCommand::AudioStreamStop => {
                // The voice pipeline is an external collaborator; accepted
                // and dropped here.
                debug!("audio stream frame ignored");
            }
        }
    }
}

// ─── Socket handlers ──────────────────────────────────────────────────────────

async fn engine_ws_handler(
    ws: WebSocketUpgrade,
    Path(process_id): Path<String>,
    State(controller): State<SharedController>,
) -> Response {
    ws.on_upgrade(move |socket| handle_engine_socket(socket, controller, process_id))
}

async fn handle_engine_socket(
    mut socket: WebSocket,
    controller: SharedController,
    process_id: String,
) {
    info!(engine = %process_id, "engine connected");
    let (tx, mut rx) = mpsc::unbounded_channel();
    controller
        .engines
        .lock()
        .unwrap()
        .insert(process_id.clone(), tx);

    let handshake = ControllerMessage::Connect {
        controller_port: controller.config.controller.port,
        core_process_id: controller.core_process_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&handshake) {
        let _ = socket.send(WsMessage::Text(json)).await;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if socket.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("unserializable controller message: {e}"),
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<EngineFrame>(&text) {
                            Ok(frame) => controller.handle_engine_frame(frame).await,
                            Err(e) => warn!(engine = %process_id, "unknown engine frame ignored: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(engine = %process_id, "engine socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    controller.engines.lock().unwrap().remove(&process_id);
    info!(engine = %process_id, "engine disconnected");
}

async fn ui_ws_handler(
    ws: WebSocketUpgrade,
    State(controller): State<SharedController>,
) -> Response {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, controller))
}

async fn send_ui(socket: &mut WebSocket, ev: &UiEvent) -> bool {
    match serde_json::to_string(ev) {
        Ok(json) => socket.send(WsMessage::Text(json)).await.is_ok(),
        Err(_) => true,
    }
}

async fn handle_ui_socket(mut socket: WebSocket, controller: SharedController) {
    let mut events = controller.ui_tx.subscribe();

    if !send_ui(
        &mut socket,
        &UiEvent::ServerInfo {
            version: controller.config.controller.version.clone(),
        },
    )
    .await
    {
        return;
    }

    // Replay the registry so late-joining clients render existing tasks.
    let snapshot: Vec<UiEvent> = {
        let processes = controller.processes.lock().unwrap();
        processes
            .iter()
            .map(|(id, row)| UiEvent::ProcessCreate {
                id: id.clone(),
                command: row.command.clone(),
                status: row.status.clone(),
                colors: colors_for(id),
            })
            .collect()
    };
    for ev in &snapshot {
        if !send_ui(&mut socket, ev).await {
            return;
        }
    }

    loop {
        tokio::select! {
            broadcasted = events.recv() => {
                match broadcasted {
                    Ok(ev) => {
                        if !send_ui(&mut socket, &ev).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("UI client lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<UiCommand>(&text) {
                            Ok(command) => controller.handle_ui_command(command).await,
                            Err(e) => warn!("invalid UI command ignored: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("UI socket error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SharedController {
        Controller::new_without_workers(Arc::new(Config::default()), "AI-core01")
    }

    fn frame(process_id: &str, event: impl Into<EngineEvent>) -> EngineFrame {
        EngineFrame {
            process_id: process_id.into(),
            event: event.into(),
        }
    }

    #[tokio::test]
    async fn process_start_registers_and_announces() {
        let c = controller();
        let mut ui = c.ui_tx.subscribe();
        c.handle_engine_frame(frame(
            "AI-core01",
            ProcessEvent::ProcessStart {
                process_id: "AI-task01".into(),
                name: "research".into(),
                command: "find things".into(),
                tool: "task".into(),
                project_ids: vec![],
            },
        ))
        .await;

        assert_eq!(c.process_status("AI-task01").as_deref(), Some("started"));
        match ui.try_recv().unwrap() {
            UiEvent::ProcessCreate {
                id,
                command,
                colors,
                ..
            } => {
                assert_eq!(id, "AI-task01");
                assert_eq!(colors, colors_for("AI-task01"));
                // Live announcement and late-join replay read the same
                // stored field.
                let stored = c
                    .processes
                    .lock()
                    .unwrap()
                    .get("AI-task01")
                    .unwrap()
                    .command
                    .clone();
                assert_eq!(command, stored);
                assert_eq!(command, "find things");
            }
            other => panic!("expected process:create, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_events_update_status_and_forward_to_core() {
        let c = controller();
        let (core_tx, mut core_rx) = mpsc::unbounded_channel();
        c.engines.lock().unwrap().insert("AI-core01".into(), core_tx);

        c.handle_engine_frame(frame(
            "AI-core01",
            ProcessEvent::ProcessStart {
                process_id: "AI-task01".into(),
                name: "n".into(),
                command: "c".into(),
                tool: "task".into(),
                project_ids: vec![],
            },
        ))
        .await;
        c.handle_engine_frame(frame(
            "AI-task01",
            ProcessEvent::ProcessDone {
                process_id: "AI-task01".into(),
                output: "done!".into(),
            },
        ))
        .await;

        assert_eq!(c.process_status("AI-task01").as_deref(), Some("completed"));
        let forwarded = core_rx.try_recv().unwrap();
        assert!(matches!(
            forwarded,
            ControllerMessage::ProcessEvent {
                process_id,
                event: ProcessEvent::ProcessDone { .. },
            } if process_id == "AI-task01"
        ));
    }

    #[tokio::test]
    async fn core_events_are_not_echoed_back_to_core() {
        let c = controller();
        let (core_tx, mut core_rx) = mpsc::unbounded_channel();
        c.engines.lock().unwrap().insert("AI-core01".into(), core_tx);

        c.handle_engine_frame(frame(
            "AI-core01",
            ProcessEvent::SystemUpdate {
                message: "overseer status".into(),
            },
        ))
        .await;
        assert!(core_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn command_start_routes_to_target_engine() {
        let c = controller();
        let (task_tx, mut task_rx) = mpsc::unbounded_channel();
        c.engines.lock().unwrap().insert("AI-task01".into(), task_tx);

        c.handle_engine_frame(frame(
            "AI-core01",
            ProcessEvent::CommandStart {
                target_process_id: "AI-task01".into(),
                command: "focus on the logs".into(),
            },
        ))
        .await;
        assert!(matches!(
            task_rx.try_recv().unwrap(),
            ControllerMessage::SystemMessage { message } if message == "focus on the logs"
        ));
    }

    #[tokio::test]
    async fn stop_command_terminates_instead_of_routing() {
        let c = controller();
        c.processes.lock().unwrap().insert(
            "AI-task01".into(),
            ProcessRow {
                command: "c".into(),
                status: "running".into(),
            },
        );
        c.handle_engine_frame(frame(
            "AI-core01",
            ProcessEvent::CommandStart {
                target_process_id: "AI-task01".into(),
                command: "stop".into(),
            },
        ))
        .await;
        assert_eq!(
            c.process_status("AI-task01").as_deref(),
            Some("terminated")
        );
    }

    #[tokio::test]
    async fn ui_chat_becomes_canonical_user_message_for_core() {
        let c = controller();
        let (core_tx, mut core_rx) = mpsc::unbounded_channel();
        c.engines.lock().unwrap().insert("AI-core01".into(), core_tx);

        c.handle_ui_command(UiCommand::CommandRun {
            command: "how are the tasks going?".into(),
        })
        .await;
        assert!(matches!(
            core_rx.try_recv().unwrap(),
            ControllerMessage::SystemMessage { message }
                if message == "User said: how are the tasks going?"
        ));
    }

    #[tokio::test]
    async fn message_deltas_relay_to_ui_logs() {
        let c = controller();
        let mut ui = c.ui_tx.subscribe();
        c.handle_engine_frame(frame(
            "AI-core01",
            StreamEvent::message_delta("m1", "thinking out loud"),
        ))
        .await;
        assert!(matches!(
            ui.try_recv().unwrap(),
            UiEvent::ProcessLogs { id, logs }
                if id == "AI-core01" && logs == "thinking out loud"
        ));
    }
}
