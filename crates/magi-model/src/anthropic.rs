//! Native Anthropic messages-API driver.
//!
//! Anthropic streams typed SSE events (`content_block_start` /
//! `content_block_delta` / `content_block_stop`), which map almost one-to-one
//! onto the event grammar — including extended-thinking blocks whose
//! `signature_delta` is forwarded on the resulting `thinking_complete`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use magi_config::ProviderConfig;

use crate::{
    pricing,
    provider::{enforce_strict_objects, EventStream, Provider, ProviderRequest},
    ItemType, Message, Role, StreamEvent, ToolCallData, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.7),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self::new(
            cfg.resolve_api_key(),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
        )
    }

    fn build_body(&self, req: &ProviderRequest) -> Value {
        let (system, messages) = build_anthropic_messages(&req.conversation.messages);

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.settings.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.settings.temperature.unwrap_or(self.temperature),
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    let mut schema = t.parameters.clone();
                    enforce_strict_objects(&mut schema);
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if let Some(choice) = &req.settings.tool_choice {
                body["tool_choice"] = match choice.as_str() {
                    "auto" => json!({ "type": "auto" }),
                    "none" => json!({ "type": "none" }),
                    "required" => json!({ "type": "any" }),
                    name => json!({ "type": "tool", "name": name }),
                };
            }
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<EventStream> {
        let key = self.api_key.as_deref().context("ANTHROPIC_API_KEY not set")?;
        let body = self.build_body(&req);

        debug!(model = %req.model, message_count = req.conversation.len(), "anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        let state = Arc::new(Mutex::new(AnthropicState::new(
            req.model.clone(),
            req.cancel.clone(),
        )));

        let scan_state = Arc::clone(&state);
        let live = resp
            .bytes_stream()
            .scan((), move |_, chunk| {
                let mut st = scan_state.lock().unwrap();
                if st.finished {
                    return future::ready(None);
                }
                let events = match chunk {
                    Ok(bytes) => st.process_bytes(&bytes),
                    Err(e) => st.fail(format!("stream error: {e}")),
                };
                future::ready(Some(events))
            })
            .flat_map(stream::iter);

        let tail_state = Arc::clone(&state);
        let tail = stream::once(future::lazy(move |_| {
            stream::iter(tail_state.lock().unwrap().finish())
        }))
        .flatten();

        Ok(Box::pin(live.chain(tail)))
    }
}

// ─── Stream decoding ──────────────────────────────────────────────────────────

enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

struct Block {
    kind: BlockKind,
    id: String,
    name: String,
    buffer: String,
    signature: Option<String>,
}

struct AnthropicState {
    model: String,
    cancel: CancellationToken,
    line_buf: String,
    finished: bool,
    message_id: String,
    message_started: bool,
    full_text: String,
    blocks: BTreeMap<u64, Block>,
    input_tokens: u64,
    output_tokens: u64,
    cached_tokens: u64,
}

impl AnthropicState {
    fn new(model: String, cancel: CancellationToken) -> Self {
        Self {
            model,
            cancel,
            line_buf: String::new(),
            finished: false,
            message_id: uuid::Uuid::new_v4().to_string(),
            message_started: false,
            full_text: String::new(),
            blocks: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
        }
    }

    fn process_bytes(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.cancel.is_cancelled() {
            self.finished = true;
            return vec![StreamEvent::stream_end()];
        }
        self.line_buf.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(nl) = self.line_buf.find('\n') {
            let line = self.line_buf[..nl].trim_end_matches('\r').to_string();
            self.line_buf.drain(..=nl);
            if let Some(data) = line.strip_prefix("data: ") {
                match serde_json::from_str::<Value>(data.trim()) {
                    Ok(v) => events.extend(self.process_event(&v)),
                    Err(_) => warn!(line = %data, "unparseable anthropic SSE data ignored"),
                }
            }
            if self.finished {
                break;
            }
        }
        events
    }

    fn process_event(&mut self, v: &Value) -> Vec<StreamEvent> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                let usage = &v["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                self.cached_tokens = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                vec![]
            }
            "content_block_start" => self.block_start(v),
            "content_block_delta" => self.block_delta(v),
            "content_block_stop" => self.block_stop(v),
            "message_delta" => {
                if let Some(out) = v.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = out;
                }
                vec![]
            }
            "message_stop" => self.finish(),
            "error" => {
                let msg = v
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown provider error");
                let code = v.pointer("/error/type").and_then(Value::as_str);
                self.finished = true;
                let mut events = vec![match code {
                    Some(c) => StreamEvent::error_with_code(msg, c),
                    None => StreamEvent::error(msg),
                }];
                events.push(StreamEvent::stream_end());
                events
            }
            // ping and unknown event types carry nothing we consume.
            _ => vec![],
        }
    }

    fn block_start(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        let block = &v["content_block"];
        match block["type"].as_str().unwrap_or("") {
            "text" => {
                self.blocks.insert(
                    index,
                    Block {
                        kind: BlockKind::Text,
                        id: String::new(),
                        name: String::new(),
                        buffer: String::new(),
                        signature: None,
                    },
                );
                if !self.message_started {
                    self.message_started = true;
                    return vec![StreamEvent::message_start(&self.message_id, Role::Assistant)];
                }
                vec![]
            }
            "thinking" => {
                let id = format!("{}_think_{index}", self.message_id);
                self.blocks.insert(
                    index,
                    Block {
                        kind: BlockKind::Thinking,
                        id: id.clone(),
                        name: String::new(),
                        buffer: String::new(),
                        signature: None,
                    },
                );
                vec![StreamEvent::thinking_start(id)]
            }
            "tool_use" => {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                let ev = StreamEvent::tool_call_start(id.clone(), Some(name.clone()));
                self.blocks.insert(
                    index,
                    Block {
                        kind: BlockKind::ToolUse,
                        id,
                        name,
                        buffer: String::new(),
                        signature: None,
                    },
                );
                vec![ev]
            }
            other => {
                warn!(block_type = %other, "unknown anthropic content block ignored");
                vec![]
            }
        }
    }

    fn block_delta(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        let delta = &v["delta"];
        let Some(block) = self.blocks.get_mut(&index) else {
            return vec![];
        };
        match delta["type"].as_str().unwrap_or("") {
            "text_delta" => {
                let text = delta["text"].as_str().unwrap_or("");
                block.buffer.push_str(text);
                self.full_text.push_str(text);
                vec![StreamEvent::message_delta(&self.message_id, text)]
            }
            "thinking_delta" => {
                let text = delta["thinking"].as_str().unwrap_or("");
                block.buffer.push_str(text);
                vec![StreamEvent::thinking_delta(&block.id, text)]
            }
            "input_json_delta" => {
                let part = delta["partial_json"].as_str().unwrap_or("");
                block.buffer.push_str(part);
                vec![StreamEvent::tool_call_delta(
                    &block.id,
                    None,
                    (!part.is_empty()).then(|| part.to_string()),
                )]
            }
            "signature_delta" => {
                let sig = delta["signature"].as_str().unwrap_or("");
                block
                    .signature
                    .get_or_insert_with(String::new)
                    .push_str(sig);
                vec![]
            }
            _ => vec![],
        }
    }

    fn block_stop(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        let Some(block) = self.blocks.remove(&index) else {
            return vec![];
        };
        match block.kind {
            BlockKind::Text => vec![],
            BlockKind::Thinking => vec![StreamEvent::thinking_complete(
                block.id,
                block.buffer,
                block.signature,
            )],
            BlockKind::ToolUse => {
                let args = if block.buffer.is_empty() {
                    "{}".to_string()
                } else {
                    block.buffer
                };
                vec![StreamEvent::tool_call_complete(ToolCallData::function(
                    block.id, block.name, args,
                ))]
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut events = Vec::new();
        // Flush any blocks the stream failed to close.
        let indices: Vec<u64> = self.blocks.keys().copied().collect();
        for index in indices {
            events.extend(self.block_stop(&json!({ "index": index })));
        }

        events.push(StreamEvent::message_complete(
            &self.message_id,
            std::mem::take(&mut self.full_text),
            None,
        ));
        events.push(StreamEvent::cost_update(Usage {
            input: self.input_tokens,
            output: self.output_tokens,
            cached: self.cached_tokens,
            cost: pricing::cost_for(
                &self.model,
                self.input_tokens,
                self.cached_tokens,
                self.output_tokens,
            ),
            model: self.model.clone(),
        }));
        events.push(StreamEvent::stream_end());
        events
    }

    fn fail(&mut self, error: String) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        vec![StreamEvent::error(error), StreamEvent::stream_end()]
    }
}

// ─── Wire message building ────────────────────────────────────────────────────

/// Split the conversation into (system text, messages array).
///
/// System and developer items join the top-level `system` field; tool calls
/// become `tool_use` blocks on assistant turns and results become
/// `tool_result` blocks on user turns, as the messages API requires.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    let mut push_block = |role: &str, block: Value, out: &mut Vec<Value>| {
        if let Some(last) = out.last_mut() {
            if last["role"] == role {
                last["content"].as_array_mut().unwrap().push(block);
                return;
            }
        }
        out.push(json!({ "role": role, "content": [block] }));
    };

    for m in messages {
        match m.item_type {
            ItemType::Message => match m.role {
                Role::System | Role::Developer => {
                    if let Some(c) = &m.content {
                        system_parts.push(c.clone());
                    }
                }
                Role::Assistant => push_block(
                    "assistant",
                    json!({ "type": "text", "text": m.content.clone().unwrap_or_default() }),
                    &mut out,
                ),
                _ => push_block(
                    "user",
                    json!({ "type": "text", "text": m.content.clone().unwrap_or_default() }),
                    &mut out,
                ),
            },
            ItemType::FunctionCall => {
                let input: Value = m
                    .arguments
                    .as_deref()
                    .and_then(|a| serde_json::from_str(a).ok())
                    .unwrap_or_else(|| json!({}));
                push_block(
                    "assistant",
                    json!({
                        "type": "tool_use",
                        "id": m.call_id.clone().unwrap_or_default(),
                        "name": m.name.clone().unwrap_or_default(),
                        "input": input,
                    }),
                    &mut out,
                );
            }
            ItemType::FunctionCallOutput => push_block(
                "user",
                json!({
                    "type": "tool_result",
                    "tool_use_id": m.call_id.clone().unwrap_or_default(),
                    "content": m.output.clone().unwrap_or_default(),
                }),
                &mut out,
            ),
            ItemType::Thinking => {
                // Replayed only when signed; unsigned thinking is dropped.
                if let Some(sig) = &m.signature {
                    push_block(
                        "assistant",
                        json!({
                            "type": "thinking",
                            "thinking": m.content.clone().unwrap_or_default(),
                            "signature": sig,
                        }),
                        &mut out,
                    );
                }
            }
        }
    }

    (system_parts.join("\n\n"), out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
