//! Folds a provider event stream into a growing conversation.
//!
//! The accumulator is purely mechanical: it buffers text, tool-call, and
//! thinking fragments keyed by id, finalizes them on their `*_complete`
//! events, and flushes leftovers at `stream_end`.  Errors are recorded, not
//! raised — a partial turn is still a usable turn.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use tracing::warn;

use magi_model::{Conversation, EventStream, Message, StreamEvent, ToolCallData, Usage};

/// Everything one provider turn produced.
///
/// Appended message order within the turn is canonical: thinking messages,
/// then the assistant text message, then one `function_call` per detected
/// tool call.
#[derive(Debug)]
pub struct TurnOutcome {
    pub conversation: Conversation,
    pub assistant_message: Option<Message>,
    pub tool_call_messages: Vec<Message>,
    pub thinking_messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallData>,
    pub errors: Vec<String>,
    pub usage: Option<Usage>,
}

#[derive(Default)]
struct ToolBuffer {
    name: Option<String>,
    args: String,
}

pub struct Accumulator {
    conversation: Conversation,
    model: Option<String>,
    text_buffers: HashMap<String, String>,
    tool_buffers: HashMap<String, ToolBuffer>,
    /// Insertion order of tool buffers, so the stream-end flush is stable.
    tool_order: Vec<String>,
    thinking_buffers: HashMap<String, String>,
    finalized_calls: HashSet<String>,
    assistant_text: Option<(String, String)>,
    tool_calls: Vec<ToolCallData>,
    thinking_messages: Vec<Message>,
    errors: Vec<String>,
    usage: Option<Usage>,
}

impl Accumulator {
    pub fn new(conversation: Conversation, model: Option<String>) -> Self {
        Self {
            conversation,
            model,
            text_buffers: HashMap::new(),
            tool_buffers: HashMap::new(),
            tool_order: Vec::new(),
            thinking_buffers: HashMap::new(),
            finalized_calls: HashSet::new(),
            assistant_text: None,
            tool_calls: Vec::new(),
            thinking_messages: Vec::new(),
            errors: Vec::new(),
            usage: None,
        }
    }

    /// Convenience: drain a whole stream and return the outcome.
    pub async fn fold(
        conversation: Conversation,
        model: Option<String>,
        mut stream: EventStream,
    ) -> TurnOutcome {
        let mut acc = Self::new(conversation, model);
        while let Some(event) = stream.next().await {
            let done = event.is_stream_end();
            acc.apply(&event);
            if done {
                break;
            }
        }
        acc.finish()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message_id, .. } => {
                self.text_buffers.entry(message_id.clone()).or_default();
            }
            StreamEvent::MessageDelta {
                message_id, delta, ..
            } => {
                self.text_buffers
                    .entry(message_id.clone())
                    .or_default()
                    .push_str(delta);
            }
            StreamEvent::MessageComplete {
                message_id,
                full_content,
                tool_calls,
                ..
            } => {
                let buffered = self.text_buffers.remove(message_id).unwrap_or_default();
                let content = if full_content.is_empty() {
                    buffered
                } else {
                    full_content.clone()
                };
                // Last complete wins when a provider re-announces the turn.
                self.assistant_text = Some((message_id.clone(), content));
                if let Some(calls) = tool_calls {
                    for call in calls {
                        self.finalize_call(call.clone());
                    }
                }
            }
            StreamEvent::ToolCallStart {
                tool_call_id,
                function_name,
                ..
            } => {
                let buf = self.tool_buffer(tool_call_id);
                if buf.name.is_none() {
                    buf.name = function_name.clone();
                }
            }
            StreamEvent::ToolCallDelta {
                tool_call_id,
                function_name,
                argument_chunk,
                ..
            } => {
                let buf = self.tool_buffer(tool_call_id);
                if let Some(name) = function_name {
                    buf.name = Some(name.clone());
                }
                if let Some(chunk) = argument_chunk {
                    buf.args.push_str(chunk);
                }
            }
            StreamEvent::ToolCallComplete { tool_call, .. } => {
                self.tool_buffers.remove(&tool_call.id);
                self.finalize_call(tool_call.clone());
            }
            StreamEvent::ToolCallsChunk { tool_calls, .. } => {
                for call in tool_calls {
                    self.tool_buffers.remove(&call.id);
                    self.finalize_call(call.clone());
                }
            }
            StreamEvent::ThinkingStart { thinking_id, .. } => {
                self.thinking_buffers.entry(thinking_id.clone()).or_default();
            }
            StreamEvent::ThinkingDelta {
                thinking_id, delta, ..
            } => {
                self.thinking_buffers
                    .entry(thinking_id.clone())
                    .or_default()
                    .push_str(delta);
            }
            StreamEvent::ThinkingComplete {
                thinking_id,
                content,
                signature,
                ..
            } => {
                let buffered = self.thinking_buffers.remove(thinking_id).unwrap_or_default();
                let content = if content.is_empty() {
                    buffered
                } else {
                    content.clone()
                };
                let mut msg = Message::thinking(thinking_id, content, signature.clone());
                if let Some(model) = &self.model {
                    msg = msg.with_model(model);
                }
                self.thinking_messages.push(msg);
            }
            StreamEvent::Error { error, .. } => {
                self.errors.push(error.clone());
            }
            StreamEvent::CostUpdate { usage, .. } => {
                self.usage = Some(usage.clone());
            }
            StreamEvent::StreamEnd { .. } => {
                self.flush_tool_buffers();
            }
            StreamEvent::Metadata { .. } => {}
        }
    }

    fn tool_buffer(&mut self, id: &str) -> &mut ToolBuffer {
        if !self.tool_buffers.contains_key(id) {
            self.tool_order.push(id.to_string());
        }
        self.tool_buffers.entry(id.to_string()).or_default()
    }

    /// A complete never duplicates an already-finalized call id.
    fn finalize_call(&mut self, call: ToolCallData) {
        if !self.finalized_calls.insert(call.id.clone()) {
            warn!(call_id = %call.id, "duplicate tool_call_complete ignored");
            return;
        }
        self.tool_calls.push(call);
    }

    /// Flush buffers that have a name and some arguments; fragments with no
    /// name cannot be dispatched and are dropped.
    fn flush_tool_buffers(&mut self) {
        for id in std::mem::take(&mut self.tool_order) {
            let Some(buf) = self.tool_buffers.remove(&id) else {
                continue;
            };
            match buf.name {
                Some(name) if !buf.args.is_empty() => {
                    self.finalize_call(ToolCallData::function(id, name, buf.args));
                }
                _ => {}
            }
        }
    }

    pub fn finish(mut self) -> TurnOutcome {
        let mut conversation = self.conversation;

        for msg in &self.thinking_messages {
            conversation.push(msg.clone());
        }

        // The assistant message is synthesized even for empty content when
        // the turn carried tool calls, so the call has an anchor turn.
        let assistant_message = match self.assistant_text.take() {
            Some((id, content)) if !content.is_empty() || !self.tool_calls.is_empty() => {
                let mut msg = Message::assistant(content);
                msg.id = Some(id);
                if let Some(model) = &self.model {
                    msg = msg.with_model(model);
                }
                conversation.push(msg.clone());
                Some(msg)
            }
            _ => None,
        };

        let mut tool_call_messages = Vec::with_capacity(self.tool_calls.len());
        for call in &self.tool_calls {
            let mut msg = Message::function_call(call);
            if let Some(model) = &self.model {
                msg = msg.with_model(model);
            }
            conversation.push(msg.clone());
            tool_call_messages.push(msg);
        }

        TurnOutcome {
            conversation,
            assistant_message,
            tool_call_messages,
            thinking_messages: self.thinking_messages,
            tool_calls: self.tool_calls,
            errors: self.errors,
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
