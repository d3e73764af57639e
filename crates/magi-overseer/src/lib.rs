mod guide;
mod memory;
mod overseer;
mod status;
mod tools;

pub use guide::{choose_guide, choose_guide_with, nudge_text, PromptGuide};
pub use memory::{MemoryEntry, MemoryStore, MemoryTerm};
pub use overseer::{Overseer, MONOLOGUE_CLASS, SUMMARY_CLASS};
pub use status::{render_system_status, StatusInputs};
pub use tools::{overseer_registry, TalkToUserTool, THOUGHT_DELAY_VALUES};
