use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "magi",
    version,
    about = "Autonomous multi-agent orchestrator",
    long_about = "MAGI runs as either the controller (mediating engines, the \
                  browser UI, and chat bridges) or an engine (the overseer \
                  monologue or a single task worker)."
)]
pub struct Cli {
    /// Explicit config file (merged over the default search path).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the controller: engine registry, UI socket, task launching.
    Controller {
        /// Listen port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one engine: the overseer, or a task worker when --task-prompt is
    /// given.
    Engine {
        /// Process identity (minted when omitted).
        #[arg(long)]
        process_id: Option<String>,

        /// Controller port to connect back to.
        #[arg(long)]
        controller_port: Option<u16>,

        /// Run as a task worker with this prompt instead of the overseer.
        #[arg(long)]
        task_prompt: Option<String>,

        /// Disable the controller socket; print events to stdout.
        #[arg(long)]
        test: bool,
    },
    /// Print the effective merged configuration as YAML.
    ShowConfig,
}
