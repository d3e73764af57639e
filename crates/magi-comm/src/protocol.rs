//! Wire protocol between the controller and its engines.
//!
//! JSON frames, one per WebSocket text message.  Engine → controller frames
//! wrap an event with the sender's process id; controller → engine messages
//! are tagged commands.  The engine endpoint is
//! `ws://<host>:<port>/ws/engine/<processId>`.

use serde::{Deserialize, Serialize};

use magi_model::StreamEvent;

// ─── Controller → Engine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommand {
    Pause,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Handshake sent on accept.  A changed port triggers reconnect.
    Connect {
        controller_port: u16,
        core_process_id: String,
    },
    /// Status update from a peer task the overseer manages.
    ProcessEvent {
        process_id: String,
        event: ProcessEvent,
    },
    ProjectUpdate {
        project_id: String,
        #[serde(default)]
        failed: bool,
        message: String,
    },
    SystemMessage {
        message: String,
    },
    SystemCommand {
        command: SystemCommand,
    },
}

// ─── Engine → Controller ──────────────────────────────────────────────────────

/// Engine lifecycle and task-supervision events.  `kind` strings are
/// disjoint from [`StreamEvent`]'s so both families share one untagged
/// envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessEvent {
    ProcessStart {
        process_id: String,
        name: String,
        command: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        project_ids: Vec<String>,
    },
    ProcessRunning {
        process_id: String,
    },
    ProcessDone {
        process_id: String,
        output: String,
    },
    ProcessFailed {
        process_id: String,
        error: String,
    },
    ProcessTerminated {
        process_id: String,
    },
    /// Guidance injected into a running task (`"stop"` terminates it).
    CommandStart {
        target_process_id: String,
        command: String,
    },
    /// Heartbeat while `wait_for_running_task` blocks.
    TaskWaiting {
        task_id: String,
        elapsed_seconds: u64,
    },
    TaskWaitComplete {
        task_id: String,
        final_status: String,
    },
    /// User-facing reply from the overseer.
    Talk {
        message: String,
        affect: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document: Option<String>,
        #[serde(default)]
        incomplete: bool,
    },
    SystemUpdate {
        message: String,
    },
    Console {
        data: String,
    },
}

/// Any event an engine can emit: a normalized provider stream event or an
/// engine lifecycle event.  Serialized untagged — the `kind` tags of the two
/// families are disjoint, so deserialization is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineEvent {
    Stream(StreamEvent),
    Process(ProcessEvent),
}

impl EngineEvent {
    /// High-frequency kinds are not persisted to disk history and not
    /// double-logged to stdout.
    pub fn is_high_frequency(&self) -> bool {
        match self {
            Self::Stream(ev) => ev.is_delta(),
            Self::Process(ProcessEvent::Console { .. }) => true,
            Self::Process(_) => false,
        }
    }
}

impl From<StreamEvent> for EngineEvent {
    fn from(ev: StreamEvent) -> Self {
        Self::Stream(ev)
    }
}

impl From<ProcessEvent> for EngineEvent {
    fn from(ev: ProcessEvent) -> Self {
        Self::Process(ev)
    }
}

/// One engine → controller frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineFrame {
    pub process_id: String,
    pub event: EngineEvent,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_message_json_round_trip() {
        let msg = ControllerMessage::Connect {
            controller_port: 3010,
            core_process_id: "AI-core01".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connect""#));
        let back: ControllerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            ControllerMessage::Connect { controller_port: 3010, .. }
        ));
    }

    #[test]
    fn system_command_serializes_snake_case() {
        let json = serde_json::to_string(&ControllerMessage::SystemCommand {
            command: SystemCommand::Pause,
        })
        .unwrap();
        assert!(json.contains(r#""command":"pause""#));
    }

    #[test]
    fn engine_frame_wraps_stream_events() {
        let frame = EngineFrame {
            process_id: "AI-abc123".into(),
            event: StreamEvent::message_delta("m1", "hi").into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: EngineFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.process_id, "AI-abc123");
        assert!(matches!(back.event, EngineEvent::Stream(_)));
    }

    #[test]
    fn engine_frame_wraps_process_events() {
        let frame = EngineFrame {
            process_id: "AI-abc123".into(),
            event: ProcessEvent::TaskWaiting {
                task_id: "AI-def456".into(),
                elapsed_seconds: 60,
            }
            .into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: EngineFrame = serde_json::from_str(&json).unwrap();
        match back.event {
            EngineEvent::Process(ProcessEvent::TaskWaiting {
                elapsed_seconds, ..
            }) => assert_eq!(elapsed_seconds, 60),
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn high_frequency_covers_deltas_and_console() {
        assert!(EngineEvent::from(StreamEvent::message_delta("m", "x")).is_high_frequency());
        assert!(EngineEvent::from(ProcessEvent::Console { data: "log".into() })
            .is_high_frequency());
        assert!(!EngineEvent::from(StreamEvent::stream_end()).is_high_frequency());
        assert!(!EngineEvent::from(ProcessEvent::SystemUpdate {
            message: "hello".into()
        })
        .is_high_frequency());
    }

    #[test]
    fn project_update_failed_defaults_false() {
        let json = r#"{"type":"project_update","project_id":"p1","message":"created"}"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ControllerMessage::ProjectUpdate { failed: false, .. }
        ));
    }
}
