mod registry;
mod running;
mod tool;
mod validate;

pub use registry::ToolRegistry;
pub use running::{RunningTool, RunningToolStatus, RunningToolTracker, WAITING_TOOL_NAMES};
pub use tool::{Tool, ToolExecution};
pub use validate::{validate_call, ToolValidationError};
