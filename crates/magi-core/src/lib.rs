mod accumulator;
mod agent;
mod cost;
mod history;
mod pause;
mod runner;

pub use accumulator::{Accumulator, TurnOutcome};
pub use agent::{Agent, AgentHooks, NoopHooks};
pub use cost::{CostTracker, ModelTotals};
pub use history::{
    categorize, is_user_said, pair_tool_calls, CompactionOutcome, History, MessageCategory,
    Summarizer, COMPACTION_PRIORITY, SUMMARY_PREFIX,
};
pub use pause::PauseController;
pub use runner::{run_agent, RunContext};
