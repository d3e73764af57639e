//! Best-effort per-process message history.
//!
//! `messages.json` lives under the engine's output directory and holds every
//! non-high-frequency event the engine emitted.  The file is rewritten on
//! each append (the log is small relative to the streams it filters) and
//! reloaded on start, surviving controller restarts but nothing stronger.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tracing::warn;

use crate::protocol::EngineEvent;

pub struct MessageLog {
    path: PathBuf,
    entries: Mutex<Vec<EngineEvent>>,
}

impl MessageLog {
    /// Open the log, loading any existing entries.
    pub fn open(output_dir: &Path, process_id: &str) -> anyhow::Result<Self> {
        let dir = output_dir.join(process_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("messages.json");
        let entries = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), "unreadable message history, starting fresh: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Append one event and rewrite the file.  High-frequency events are
    /// skipped.  Disk errors are logged, never fatal.
    pub fn append(&self, event: &EngineEvent) {
        if event.is_high_frequency() {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push(event.clone());
        match serde_json::to_string_pretty(&*entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), "failed to persist message history: {e}");
                }
            }
            Err(e) => warn!("failed to serialize message history: {e}"),
        }
    }

    pub fn entries(&self) -> Vec<EngineEvent> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProcessEvent;
    use magi_model::StreamEvent;

    #[test]
    fn append_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::open(dir.path(), "AI-test01").unwrap();
        log.append(&StreamEvent::message_complete("m1", "hello", None).into());
        log.append(
            &ProcessEvent::SystemUpdate {
                message: "status".into(),
            }
            .into(),
        );
        assert_eq!(log.len(), 2);

        let reloaded = MessageLog::open(dir.path(), "AI-test01").unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.entries(), log.entries());
    }

    #[test]
    fn high_frequency_events_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::open(dir.path(), "AI-test02").unwrap();
        log.append(&StreamEvent::message_delta("m1", "chunk").into());
        log.append(&ProcessEvent::Console { data: "noise".into() }.into());
        assert!(log.is_empty());
    }

    #[test]
    fn corrupt_history_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("AI-test03");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("messages.json"), "not json at all").unwrap();
        let log = MessageLog::open(dir.path(), "AI-test03").unwrap();
        assert!(log.is_empty());
    }
}
