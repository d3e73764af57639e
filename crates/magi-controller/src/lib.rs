mod colors;
mod server;
mod ui;

pub use colors::{colors_for, Colors};
pub use server::{Controller, SharedController};
pub use ui::{UiCommand, UiEvent};
