//! Shared driver for every provider that speaks the `/chat/completions` SSE
//! wire format (deepseek, xai, openrouter, openai, local servers).
//!
//! Each configured endpoint gets one `OpenAiCompatProvider` with its own
//! base URL, auth style, and extra headers.  The driver translates the
//! conversation into the wire shape, streams the response, and normalizes it
//! into the event grammar, synthesizing `tool_call_start` /
//! `tool_call_complete` where the upstream only sends fragments.

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
    reasoner, ItemType, Message, Role, StreamEvent, ToolCallData, Usage,
};

/// How the API key is attached to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — every hosted provider here.
    Bearer,
    /// No authentication header — local servers.
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    /// Extra key-value pairs merged verbatim into the request body
    /// (e.g. OpenRouter's `provider` routing hint with its failover sort).
    extra_body: Value,
}

impl OpenAiCompatProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: impl Into<String>,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name: driver_name.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.7),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
            extra_body,
        }
    }

    pub fn from_config(name: &str, cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .with_context(|| format!("provider '{name}' requires base_url"))?;
        let key = cfg.resolve_api_key();
        let auth = if key.is_some() {
            AuthStyle::Bearer
        } else {
            AuthStyle::None
        };
        let mut headers: Vec<(String, String)> = cfg
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        Ok(Self::new(
            name,
            key,
            base_url,
            cfg.max_tokens,
            cfg.temperature,
            headers,
            auth,
            cfg.extra_body.clone(),
        ))
    }

    fn build_body(&self, req: &ProviderRequest) -> Value {
        let use_reasoner = reasoner::is_reasoner_model(&req.model);

        let messages: Vec<Value> = if use_reasoner {
            let prepared = reasoner::prepare_reasoner_messages(&req.conversation, &req.tools);
            build_wire_messages(&prepared)
        } else {
            build_wire_messages(&req.conversation.messages)
        };

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": true,
            "max_tokens": req.settings.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.settings.temperature.unwrap_or(self.temperature),
            "stream_options": { "include_usage": true },
        });

        if !use_reasoner {
            // Grok's hosted search is not a function tool: it is requested
            // through `search_parameters` on the body.  Rewrite and drop the
            // placeholder tool when present.
            let mut tools: Vec<_> = req.tools.iter().collect();
            if self.driver_name == "xai" {
                if tools.iter().any(|t| t.name == "web_search") {
                    tools.retain(|t| t.name != "web_search");
                    body["search_parameters"] = json!({ "mode": "auto" });
                }
            }

            let tool_schemas: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut params = t.parameters.clone();
                    enforce_strict_objects(&mut params);
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": params,
                        }
                    })
                })
                .collect();
            if !tool_schemas.is_empty() {
                body["tools"] = json!(tool_schemas);
                if let Some(choice) = &req.settings.tool_choice {
                    body["tool_choice"] = match choice.as_str() {
                        "auto" | "none" | "required" => json!(choice),
                        name => json!({ "type": "function", "function": { "name": name } }),
                    };
                }
            }
        }

        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.driver_name
    }

    async fn run(&self, req: ProviderRequest) -> anyhow::Result<EventStream> {
        let body = self.build_body(&req);

        debug!(
            driver = %self.driver_name,
            model = %req.model,
            message_count = req.conversation.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let AuthStyle::Bearer = self.auth_style {
            let key = self
                .api_key
                .as_deref()
                .context("API key not set; provide api_key or api_key_env in config")?;
            http_req = http_req.bearer_auth(key);
        }
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let state = Arc::new(Mutex::new(SseState::new(
            req.model.clone(),
            reasoner::is_reasoner_model(&req.model),
            req.cancel.clone(),
        )));

        // SSE frames can split across TCP packets, so a carry-over line
        // buffer lives in the state and only complete lines are parsed.
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

        // The upstream may end without a [DONE] sentinel; flush whatever is
        // buffered once the byte stream is exhausted.
        let tail_state = Arc::clone(&state);
        let tail = stream::once(future::lazy(move |_| {
            stream::iter(tail_state.lock().unwrap().finish())
        }))
        .flatten();

        Ok(Box::pin(live.chain(tail)))
    }
}

// ─── SSE decoding state ───────────────────────────────────────────────────────

#[derive(Default)]
struct ToolBuffer {
    id: String,
    name: String,
    args: String,
}

struct SseState {
    model: String,
    reasoner: bool,
    cancel: CancellationToken,
    line_buf: String,
    finished: bool,
    message_id: String,
    message_started: bool,
    full_text: String,
    thinking_id: String,
    thinking_open: bool,
    thinking_text: String,
    /// Keyed by the provider's parallel-tool-call index.
    tool_buffers: BTreeMap<u32, ToolBuffer>,
    completed_call_ids: Vec<String>,
    usage: Option<Usage>,
}

impl SseState {
    fn new(model: String, reasoner: bool, cancel: CancellationToken) -> Self {
        Self {
            model,
            reasoner,
            cancel,
            line_buf: String::new(),
            finished: false,
            message_id: uuid::Uuid::new_v4().to_string(),
            message_started: false,
            full_text: String::new(),
            thinking_id: uuid::Uuid::new_v4().to_string(),
            thinking_open: false,
            thinking_text: String::new(),
            tool_buffers: BTreeMap::new(),
            completed_call_ids: Vec::new(),
            usage: None,
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
            events.extend(self.process_line(&line));
            if self.finished {
                break;
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let Some(data) = line.strip_prefix("data: ") else {
            return vec![];
        };
        let data = data.trim();
        if data.is_empty() {
            return vec![];
        }
        if data == "[DONE]" {
            return self.finish();
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            warn!(driver_line = %data, "unparseable SSE data line ignored");
            return vec![];
        };
        self.process_chunk(&v)
    }

    fn process_chunk(&mut self, v: &Value) -> Vec<StreamEvent> {
        // Usage-only chunk (stream_options.include_usage). DeepSeek reports
        // cache hits as prompt_cache_hit_tokens on the root usage object;
        // the OpenAI shape nests them under prompt_tokens_details.
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            let cached = usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(Value::as_u64)
                .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(Value::as_u64))
                .unwrap_or(0);
            let input = usage["prompt_tokens"].as_u64().unwrap_or(0);
            let output = usage["completion_tokens"].as_u64().unwrap_or(0);
            self.usage = Some(Usage {
                input,
                output,
                cached,
                cost: pricing::cost_for(&self.model, input, cached, output),
                model: self.model.clone(),
            });
            return vec![];
        }

        let delta = &v["choices"][0]["delta"];
        let mut events = Vec::new();

        // Thinking deltas: reasoning_content (deepseek, llama.cpp) or
        // reasoning (openrouter).
        let thinking = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .or_else(|| delta.get("reasoning").and_then(Value::as_str));
        if let Some(t) = thinking.filter(|t| !t.is_empty()) {
            if !self.thinking_open {
                self.thinking_open = true;
                events.push(StreamEvent::thinking_start(&self.thinking_id));
            }
            self.thinking_text.push_str(t);
            events.push(StreamEvent::thinking_delta(&self.thinking_id, t));
            return events;
        }

        if let Some(tc) = delta.get("tool_calls").and_then(|a| a.get(0)) {
            events.extend(self.close_thinking());
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc.pointer("/function/name").and_then(Value::as_str).unwrap_or("");
            let args = tc
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("");

            let is_new = !self.tool_buffers.contains_key(&index);
            let buf = self.tool_buffers.entry(index).or_default();
            if !id.is_empty() {
                buf.id = id.to_string();
            }
            if !name.is_empty() {
                buf.name = name.to_string();
            }
            buf.args.push_str(args);

            if is_new {
                events.push(StreamEvent::tool_call_start(
                    buf.id.clone(),
                    (!buf.name.is_empty()).then(|| buf.name.clone()),
                ));
            }
            events.push(StreamEvent::tool_call_delta(
                buf.id.clone(),
                (!name.is_empty()).then(|| name.to_string()),
                (!args.is_empty()).then(|| args.to_string()),
            ));
            return events;
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.extend(self.close_thinking());
                if !self.message_started {
                    self.message_started = true;
                    events.push(StreamEvent::message_start(&self.message_id, Role::Assistant));
                }
                self.full_text.push_str(text);
                events.push(StreamEvent::message_delta(&self.message_id, text));
            }
        }
        events
    }

    fn close_thinking(&mut self) -> Vec<StreamEvent> {
        if !self.thinking_open {
            return vec![];
        }
        self.thinking_open = false;
        let content = std::mem::take(&mut self.thinking_text);
        vec![StreamEvent::thinking_complete(&self.thinking_id, content, None)]
    }

    /// End-of-call flush: finalize tool buffers, reasoner trailer, message
    /// completion, cost, and the terminal `stream_end`.  Idempotent.
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut events = self.close_thinking();

        let mut text = std::mem::take(&mut self.full_text);
        let mut final_calls: Vec<ToolCallData> = Vec::new();

        // Buffered fragment calls: a call with no name cannot be dispatched
        // and is dropped; everything else is finalized even when the
        // arguments do not parse — validation rejects those per call.
        for (_, buf) in std::mem::take(&mut self.tool_buffers) {
            if buf.name.is_empty() {
                warn!(tool_call_id = %buf.id, "dropping tool call fragment with no name");
                continue;
            }
            let id = if buf.id.is_empty() {
                format!("call_{}", uuid::Uuid::new_v4().simple())
            } else {
                buf.id
            };
            if self.completed_call_ids.iter().any(|c| *c == id) {
                continue;
            }
            self.completed_call_ids.push(id.clone());
            let args = if buf.args.is_empty() { "{}".into() } else { buf.args };
            final_calls.push(ToolCallData::function(id, buf.name, args));
        }

        // Reasoner models deliver calls as a text trailer instead.
        if self.reasoner {
            if let Some((cleaned, calls)) = reasoner::parse_reasoner_tool_calls(&text) {
                text = cleaned;
                events.push(StreamEvent::tool_calls_chunk(calls));
            }
        }
        for call in final_calls {
            events.push(StreamEvent::tool_call_complete(call));
        }

        events.push(StreamEvent::message_complete(&self.message_id, text, None));
        if let Some(usage) = self.usage.take() {
            events.push(StreamEvent::cost_update(usage));
        }
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

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System | Role::Developer => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert conversation items into the chat-completions message array.
///
/// Consecutive `function_call` items are coalesced into a single assistant
/// message with a `tool_calls` array, which the parallel-tool-call wire
/// format requires.  Thinking items are not replayed.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut result = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        match m.item_type {
            ItemType::Thinking => {
                i += 1;
            }
            ItemType::FunctionCall => {
                let mut calls = Vec::new();
                while i < messages.len() && messages[i].item_type == ItemType::FunctionCall {
                    let fc = &messages[i];
                    calls.push(json!({
                        "id": fc.call_id.clone().unwrap_or_default(),
                        "type": "function",
                        "function": {
                            "name": fc.name.clone().unwrap_or_default(),
                            "arguments": fc.arguments.clone().unwrap_or_else(|| "{}".into()),
                        }
                    }));
                    i += 1;
                }
                result.push(json!({ "role": "assistant", "tool_calls": calls }));
            }
            ItemType::FunctionCallOutput => {
                result.push(json!({
                    "role": "tool",
                    "tool_call_id": m.call_id.clone().unwrap_or_default(),
                    "content": m.output.clone().unwrap_or_default(),
                }));
                i += 1;
            }
            ItemType::Message => {
                result.push(json!({
                    "role": wire_role(m.role),
                    "content": m.content.clone().unwrap_or_default(),
                }));
                i += 1;
            }
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
