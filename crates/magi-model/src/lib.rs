mod anthropic;
mod events;
mod mock;
mod openai_compat;
pub mod pricing;
mod provider;
pub mod reasoner;
mod registry;
mod rotation;
mod types;

pub use anthropic::AnthropicProvider;
pub use events::StreamEvent;
pub use mock::{EchoProvider, ScriptedProvider};
pub use openai_compat::{AuthStyle, OpenAiCompatProvider};
pub use provider::{
    enforce_strict_objects, EventStream, ModelSettings, Provider, ProviderRequest, ToolSchema,
};
pub use registry::ProviderRegistry;
pub use rotation::{ModelRotation, STANDARD_CLASS};
pub use types::{
    Conversation, FunctionCallData, ItemType, Message, Role, ToolCallData, Usage,
};
