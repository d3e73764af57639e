//! Pause/resume plumbing for attached terminal sessions.
//!
//! The real PTY wiring lives outside the engine; the supervisor only needs
//! a sink to broadcast control bytes into.  Pause sends a double-escape to
//! abort code-assistant providers mid-keystroke; resume sends a "continue"
//! line plus a ladder of newline variants for shells that swallow the
//! first.

use std::sync::Mutex;

use magi_core::PauseController;
use magi_tools::RunningToolTracker;

use crate::SystemCommand;

/// Double-escape aborts interactive assistants running in a PTY.
pub const PAUSE_SEQUENCE: &[u8] = b"\x1b\x1b";

/// Sent in order on resume.
pub const RESUME_SEQUENCES: &[&[u8]] = &[b"Please continue\r\n", b"\r\n", b"\n"];

pub trait PtyBus: Send + Sync {
    /// Write `bytes` to every attached PTY.
    fn broadcast(&self, bytes: &[u8]);
}

/// Default bus: records writes.  Stands in wherever no PTYs are attached
/// and doubles as the test observer.
#[derive(Default)]
pub struct RecordingPtyBus {
    writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPtyBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl PtyBus for RecordingPtyBus {
    fn broadcast(&self, bytes: &[u8]) {
        self.writes.lock().unwrap().push(bytes.to_vec());
    }
}

/// Apply a `system_command` from the controller: gate (or ungate) provider
/// calls, nudge attached PTYs, and interrupt in-flight waits so the
/// overseer notices immediately.
pub fn apply_system_command(
    command: SystemCommand,
    pause: &PauseController,
    running_tools: &RunningToolTracker,
    pty: &dyn PtyBus,
) {
    match command {
        SystemCommand::Pause => {
            pause.pause();
            pty.broadcast(PAUSE_SEQUENCE);
            running_tools.interrupt_waiting("system pause");
        }
        SystemCommand::Resume => {
            pause.resume();
            for seq in RESUME_SEQUENCES {
                pty.broadcast(seq);
            }
            running_tools.interrupt_waiting("system resume");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
