mod ops;
mod process;
mod pty;
mod wait;

pub use magi_comm::SystemCommand;
pub use ops::TaskSupervisor;
pub use process::{mint_process_id, Process, ProcessStatus, ProcessTracker};
pub use pty::{
    apply_system_command, PtyBus, RecordingPtyBus, PAUSE_SEQUENCE, RESUME_SEQUENCES,
};
pub use wait::wait_for_running_task;
