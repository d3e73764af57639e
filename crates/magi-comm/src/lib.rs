mod client;
mod console;
mod persist;
mod protocol;

pub use client::{CommClient, CommClientConfig, RECONNECT_DELAY};
pub use console::ConsolePrinter;
pub use persist::MessageLog;
pub use protocol::{
    ControllerMessage, EngineEvent, EngineFrame, ProcessEvent, SystemCommand,
};
