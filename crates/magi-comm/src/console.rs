//! Test-mode output: with the socket disabled, events are pretty-printed to
//! stdout in a delta-aware way so streamed text reads as continuous prose.

use std::io::Write;

use magi_model::StreamEvent;

use crate::protocol::EngineEvent;

#[derive(Default)]
pub struct ConsolePrinter {
    /// Whether the last write was an unterminated delta.
    mid_stream: bool,
}

impl ConsolePrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Stream(StreamEvent::MessageDelta { delta, .. })
            | EngineEvent::Stream(StreamEvent::ThinkingDelta { delta, .. }) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
                self.mid_stream = true;
            }
            EngineEvent::Stream(StreamEvent::MessageComplete { .. }) => {
                if self.mid_stream {
                    println!();
                    self.mid_stream = false;
                }
            }
            other => {
                if self.mid_stream {
                    println!();
                    self.mid_stream = false;
                }
                match serde_json::to_string_pretty(other) {
                    Ok(json) => println!("{json}"),
                    Err(_) => println!("{other:?}"),
                }
            }
        }
    }
}
