//! Controller ↔ browser UI socket protocol (JSON frames).

use serde::{Deserialize, Serialize};

use crate::colors::Colors;

/// Controller → UI events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    #[serde(rename = "server:info")]
    ServerInfo { version: String },
    #[serde(rename = "process:create")]
    ProcessCreate {
        id: String,
        command: String,
        status: String,
        colors: Colors,
    },
    #[serde(rename = "process:logs")]
    ProcessLogs { id: String, logs: String },
    #[serde(rename = "process:update")]
    ProcessUpdate { id: String, status: String },
}

/// UI → controller commands.  Field names are camelCase on the wire
/// (`processId`), matching what the browser client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum UiCommand {
    /// Chat entry: text for the overseer.
    #[serde(rename = "command:run")]
    CommandRun { command: String },
    /// Guidance into a specific task.
    #[serde(rename = "process:command")]
    ProcessCommand {
        process_id: String,
        command: String,
    },
    #[serde(rename = "process:terminate")]
    ProcessTerminate { process_id: String },
    // Audio streaming control; the voice pipeline consuming these is an
    // external collaborator.
    #[serde(rename = "audio:stream_start")]
    AudioStreamStart,
    #[serde(rename = "audio:stream_data")]
    AudioStreamData { chunk: String },
    #[serde(rename = "audio:stream_stop")]
    AudioStreamStop,
}
