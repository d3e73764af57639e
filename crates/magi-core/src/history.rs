//! Overseer history: an append-only message log with thread merging,
//! category-aware compaction, and the monologue helper.
//!
//! Compaction replaces a chosen subset of old messages with one synthesized
//! summary.  Selection walks categories in priority order (most expendable
//! first), always protects the newest 20 % of each category, and drags a
//! tool call's paired output along so no orphaned half survives.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tracing::warn;

use magi_model::{ItemType, Message, Role};

pub const SUMMARY_PREFIX: &str = "Summary of previous messages: ";

/// Lookahead window for pairing a tool call with its output.
const PAIR_LOOKAHEAD: usize = 10;

/// Fewest messages compaction must leave behind.
const MIN_REMAINING: usize = 4;

// ─── Categorization ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    SystemInstruction,
    UserSaid,
    UserInput,
    TalkToUserToolCall,
    ToolCall,
    ToolResult,
    ToolError,
    AssistantThought,
    AssistantResponse,
    SystemError,
    HistorySummary,
    Unknown,
}

/// Compaction priority: most expendable first.  Selection never reaches the
/// tail categories unless the head ones run dry.
pub const COMPACTION_PRIORITY: &[MessageCategory] = &[
    MessageCategory::AssistantThought,
    MessageCategory::ToolResult,
    MessageCategory::ToolCall,
    MessageCategory::AssistantResponse,
    MessageCategory::UserInput,
    MessageCategory::HistorySummary,
    MessageCategory::ToolError,
    MessageCategory::SystemError,
    MessageCategory::TalkToUserToolCall,
    MessageCategory::UserSaid,
    MessageCategory::SystemInstruction,
    MessageCategory::Unknown,
];

pub fn categorize(msg: &Message) -> MessageCategory {
    match msg.item_type {
        ItemType::Thinking => MessageCategory::AssistantThought,
        ItemType::FunctionCall => {
            if msg.name.as_deref().is_some_and(|n| n.starts_with("talk_to_")) {
                MessageCategory::TalkToUserToolCall
            } else {
                MessageCategory::ToolCall
            }
        }
        ItemType::FunctionCallOutput => {
            let output = msg.output.as_deref().unwrap_or("");
            if output.trim_start().starts_with(r#"{"error""#) {
                MessageCategory::ToolError
            } else {
                MessageCategory::ToolResult
            }
        }
        ItemType::Message => {
            let content = msg.content.as_deref().unwrap_or("");
            match msg.role {
                Role::System | Role::Developer => {
                    if content.starts_with(SUMMARY_PREFIX.trim_end()) {
                        MessageCategory::HistorySummary
                    } else if content.starts_with("[system error") {
                        MessageCategory::SystemError
                    } else {
                        MessageCategory::SystemInstruction
                    }
                }
                Role::User => {
                    if is_user_said(content) {
                        MessageCategory::UserSaid
                    } else {
                        MessageCategory::UserInput
                    }
                }
                Role::Assistant => MessageCategory::AssistantResponse,
                Role::Tool => MessageCategory::Unknown,
            }
        }
    }
}

/// Canonical ingestion prefix for direct human turns: `"<name> said: ..."`.
pub fn is_user_said(content: &str) -> bool {
    match content.split_once(" said:") {
        Some((name, _)) => !name.is_empty() && !name.contains(char::is_whitespace),
        None => false,
    }
}

/// Pair each `function_call` index with the first subsequent output sharing
/// its call id, within the lookahead window.  The returned map is
/// bidirectional.
pub fn pair_tool_calls(messages: &[Message]) -> HashMap<usize, usize> {
    let mut pairs = HashMap::new();
    for (i, msg) in messages.iter().enumerate() {
        if msg.item_type != ItemType::FunctionCall {
            continue;
        }
        let Some(call_id) = msg.call_id.as_deref() else {
            continue;
        };
        let window_end = (i + 1 + PAIR_LOOKAHEAD).min(messages.len());
        for (j, candidate) in messages.iter().enumerate().take(window_end).skip(i + 1) {
            if candidate.item_type == ItemType::FunctionCallOutput
                && candidate.call_id.as_deref() == Some(call_id)
            {
                pairs.insert(i, j);
                pairs.insert(j, i);
                break;
            }
        }
    }
    pairs
}

// ─── Summarizer seam ──────────────────────────────────────────────────────────

/// The compaction summarizer is itself a provider call in production;
/// injecting it keeps compaction testable with a stub.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, history_text: &str) -> anyhow::Result<String>;
}

// ─── History ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    NotNeeded,
    Summarized { removed: usize },
    /// The summarizer failed; the oldest messages were dropped instead.
    Truncated { removed: usize },
}

pub struct History {
    messages: Vec<Message>,
    pending_threads: VecDeque<Vec<Message>>,
    token_limit: usize,
    ai_name: String,
}

impl History {
    pub fn new(ai_name: impl Into<String>, token_limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            pending_threads: VecDeque::new(),
            token_limit,
            ai_name: ai_name.into(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.messages.extend(msgs);
    }

    /// Queue a thread produced by a concurrent sub-agent.  Threads merge at
    /// the next monologue-turn boundary, not mid-turn.
    pub fn push_thread(&mut self, thread: Vec<Message>) {
        self.pending_threads.push_back(thread);
    }

    /// Drain queued threads FIFO and append their messages.  Returns how
    /// many messages merged.
    pub fn drain_threads(&mut self) -> usize {
        let mut merged = 0;
        while let Some(thread) = self.pending_threads.pop_front() {
            merged += thread.len();
            self.messages.extend(thread);
        }
        merged
    }

    /// Append a monologue thought, normalizing away self-naming prefixes the
    /// model tends to produce (`Magi:`, `Thoughts:`, combinations thereof).
    pub fn add_monologue(&mut self, text: &str) {
        let stripped = self.strip_monologue_prefix(text);
        self.messages
            .push(Message::assistant(format!("{} thoughts: {stripped}", self.ai_name)));
    }

    fn strip_monologue_prefix<'a>(&self, text: &'a str) -> &'a str {
        let mut rest = text.trim();
        for _ in 0..2 {
            let lower = rest.to_lowercase();
            let name = self.ai_name.to_lowercase();
            if lower.starts_with(&name) {
                rest = rest[self.ai_name.len()..].trim_start_matches([':', ',']).trim_start();
            } else if let Some(tail) = lower
                .strip_prefix("thoughts")
                .or_else(|| lower.strip_prefix("thought"))
            {
                let consumed = rest.len() - tail.len();
                rest = rest[consumed..].trim_start_matches([':', ',']).trim_start();
            } else {
                break;
            }
        }
        rest
    }

    /// chars/4 token approximation over the whole history.
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(Message::char_len).sum::<usize>() / 4
    }

    pub fn is_over_limit(&self) -> bool {
        self.approx_tokens() > self.token_limit
    }

    /// Compact when over the token limit.
    ///
    /// On summarizer failure this falls back to tail truncation — dropping
    /// the same selection without a summary — so compaction always succeeds.
    pub async fn compact(&mut self, summarizer: &dyn Summarizer) -> CompactionOutcome {
        let total_tokens = self.approx_tokens();
        if total_tokens <= self.token_limit || self.messages.is_empty() {
            return CompactionOutcome::NotNeeded;
        }

        let excess = total_tokens - self.token_limit;
        let avg = (total_tokens / self.messages.len()).max(1);
        let mut target = excess.div_ceil(avg);
        target = target.min(self.messages.len().saturating_sub(MIN_REMAINING));
        if target == 0 {
            return CompactionOutcome::NotNeeded;
        }

        let selected = self.select_for_compaction(target, excess);
        if selected.is_empty() {
            return CompactionOutcome::NotNeeded;
        }

        let serialized = serialize_messages(&self.messages, &selected);
        match summarizer.summarize(&serialized).await {
            Ok(summary) if !summary.is_empty() => {
                let removed = selected.len();
                self.splice_summary(&selected, &summary);
                CompactionOutcome::Summarized { removed }
            }
            outcome => {
                if let Err(e) = outcome {
                    warn!("compaction summarizer failed, falling back to truncation: {e}");
                } else {
                    warn!("compaction summarizer returned empty text, truncating instead");
                }
                let keep_from = target.min(self.messages.len());
                self.messages.drain(..keep_from);
                CompactionOutcome::Truncated { removed: keep_from }
            }
        }
    }

    /// Choose message indices, oldest first within each category, walking
    /// the priority order and protecting the newest 20 % per category.
    /// Selecting either half of a tool pair selects the other half too.
    /// Selection stops once both the message-count target and the token
    /// excess are covered, so one pass always lands under the limit when
    /// enough eligible messages exist.
    fn select_for_compaction(&self, target: usize, excess_tokens: usize) -> BTreeSet<usize> {
        let pairs = pair_tool_calls(&self.messages);
        let max_removable = self.messages.len().saturating_sub(MIN_REMAINING);

        let mut by_category: HashMap<MessageCategory, Vec<usize>> = HashMap::new();
        for (i, msg) in self.messages.iter().enumerate() {
            by_category.entry(categorize(msg)).or_default().push(i);
        }

        let mut selected: BTreeSet<usize> = BTreeSet::new();
        let mut selected_tokens = 0usize;
        'walk: for category in COMPACTION_PRIORITY {
            let Some(indices) = by_category.get(category) else {
                continue;
            };
            let protected = indices.len().div_ceil(5);
            let eligible = &indices[..indices.len() - protected];
            for &idx in eligible {
                if (selected.len() >= target && selected_tokens >= excess_tokens)
                    || selected.len() >= max_removable
                {
                    break 'walk;
                }
                if selected.insert(idx) {
                    selected_tokens += self.messages[idx].approx_tokens();
                    if let Some(&partner) = pairs.get(&idx) {
                        if selected.insert(partner) {
                            selected_tokens += self.messages[partner].approx_tokens();
                        }
                    }
                }
            }
        }
        selected
    }

    fn splice_summary(&mut self, selected: &BTreeSet<usize>, summary: &str) {
        let insert_at = *selected.iter().next().unwrap_or(&0);
        let mut remaining = Vec::with_capacity(self.messages.len() - selected.len() + 1);
        for (i, msg) in self.messages.drain(..).enumerate() {
            if i == insert_at {
                remaining.push(Message::system(format!("{SUMMARY_PREFIX}{summary}")));
            }
            if !selected.contains(&i) {
                remaining.push(msg);
            }
        }
        self.messages = remaining;
    }
}

/// Serialize the selected messages with stable ordering for the summary
/// prompt.
fn serialize_messages(messages: &[Message], selected: &BTreeSet<usize>) -> String {
    selected
        .iter()
        .filter_map(|&i| messages.get(i))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Developer => "Developer",
                Role::System => "System",
                Role::Tool => "Tool",
            };
            let body = match m.item_type {
                ItemType::FunctionCall => format!(
                    "[tool_call {}: {}({})]",
                    m.call_id.as_deref().unwrap_or(""),
                    m.name.as_deref().unwrap_or(""),
                    m.arguments.as_deref().unwrap_or("")
                ),
                ItemType::FunctionCallOutput => format!(
                    "[tool_result {}: {}]",
                    m.call_id.as_deref().unwrap_or(""),
                    m.output.as_deref().unwrap_or("")
                ),
                _ => m.content.clone().unwrap_or_default(),
            };
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use magi_model::ToolCallData;

    struct StubSummarizer;

    #[async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(&self, _history_text: &str) -> anyhow::Result<String> {
            Ok("condensed".into())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _history_text: &str) -> anyhow::Result<String> {
            anyhow::bail!("summarizer model unavailable")
        }
    }

    // ── Categorization ────────────────────────────────────────────────────────

    #[test]
    fn categorize_covers_message_shapes() {
        let call = ToolCallData::function("c", "start_task", "{}");
        let talk = ToolCallData::function("c2", "talk_to_user", "{}");
        assert_eq!(
            categorize(&Message::function_call(&call)),
            MessageCategory::ToolCall
        );
        assert_eq!(
            categorize(&Message::function_call(&talk)),
            MessageCategory::TalkToUserToolCall
        );
        assert_eq!(
            categorize(&Message::function_call_output("c", "ok")),
            MessageCategory::ToolResult
        );
        assert_eq!(
            categorize(&Message::function_call_output("c", r#"{"error":"nope"}"#)),
            MessageCategory::ToolError
        );
        assert_eq!(
            categorize(&Message::thinking("t", "hmm", None)),
            MessageCategory::AssistantThought
        );
        assert_eq!(
            categorize(&Message::assistant("reply")),
            MessageCategory::AssistantResponse
        );
        assert_eq!(
            categorize(&Message::system("be helpful")),
            MessageCategory::SystemInstruction
        );
        assert_eq!(
            categorize(&Message::system(format!("{SUMMARY_PREFIX}older stuff"))),
            MessageCategory::HistorySummary
        );
        assert_eq!(
            categorize(&Message::developer("[system error] provider down")),
            MessageCategory::SystemError
        );
        assert_eq!(
            categorize(&Message::user("Alice said: hello there")),
            MessageCategory::UserSaid
        );
        assert_eq!(
            categorize(&Message::user("raw command input")),
            MessageCategory::UserInput
        );
    }

    #[test]
    fn pairing_finds_output_within_window() {
        let call = ToolCallData::function("c1", "f", "{}");
        let msgs = vec![
            Message::function_call(&call),
            Message::assistant("interleaved"),
            Message::function_call_output("c1", "out"),
        ];
        let pairs = pair_tool_calls(&msgs);
        assert_eq!(pairs.get(&0), Some(&2));
        assert_eq!(pairs.get(&2), Some(&0));
    }

    #[test]
    fn pairing_respects_lookahead_window() {
        let call = ToolCallData::function("c1", "f", "{}");
        let mut msgs = vec![Message::function_call(&call)];
        for i in 0..PAIR_LOOKAHEAD {
            msgs.push(Message::assistant(format!("filler {i}")));
        }
        msgs.push(Message::function_call_output("c1", "too late"));
        assert!(pair_tool_calls(&msgs).is_empty());
    }

    // ── Monologue helper ──────────────────────────────────────────────────────

    #[test]
    fn add_monologue_strips_name_and_thought_prefixes() {
        let mut h = History::new("Magi", 50_000);
        h.add_monologue("Magi: Thoughts: I should check the tasks.");
        let content = h.messages()[0].content.as_deref().unwrap();
        assert_eq!(content, "Magi thoughts: I should check the tasks.");
    }

    #[test]
    fn add_monologue_keeps_plain_text() {
        let mut h = History::new("Magi", 50_000);
        h.add_monologue("ready to work");
        assert_eq!(
            h.messages()[0].content.as_deref(),
            Some("Magi thoughts: ready to work")
        );
    }

    // ── Thread merging ────────────────────────────────────────────────────────

    #[test]
    fn threads_merge_fifo_at_drain() {
        let mut h = History::new("Magi", 50_000);
        h.push_thread(vec![Message::assistant("first thread")]);
        h.push_thread(vec![Message::assistant("second thread")]);
        assert_eq!(h.messages().len(), 0, "threads wait for the turn boundary");
        assert_eq!(h.drain_threads(), 2);
        assert_eq!(
            h.messages()[0].content.as_deref(),
            Some("first thread")
        );
        assert_eq!(
            h.messages()[1].content.as_deref(),
            Some("second thread")
        );
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn seeded_history(limit: usize) -> History {
        let mut h = History::new("Magi", limit);
        h.push(Message::system("You are Magi, the overseer."));
        for i in 0..40 {
            h.push(Message::user(format!("User said: request number {i} {}", "x".repeat(400))));
            let call = ToolCallData::function(format!("c{i}"), "start_task", "{}");
            h.push(Message::function_call(&call));
            h.push(Message::function_call_output(
                format!("c{i}"),
                format!("result {i} {}", "y".repeat(400)),
            ));
            h.push(Message::assistant(format!("thought {i} {}", "z".repeat(400))));
        }
        h
    }

    #[tokio::test]
    async fn compact_noop_under_limit() {
        let mut h = History::new("Magi", 50_000);
        h.push(Message::user("small"));
        assert_eq!(
            h.compact(&StubSummarizer).await,
            CompactionOutcome::NotNeeded
        );
    }

    #[tokio::test]
    async fn compact_brings_history_under_limit_with_one_summary() {
        let mut h = seeded_history(10_000);
        assert!(h.is_over_limit());
        let outcome = h.compact(&StubSummarizer).await;
        assert!(matches!(outcome, CompactionOutcome::Summarized { .. }));
        assert!(
            h.approx_tokens() <= 10_000,
            "post-compaction tokens {} over limit",
            h.approx_tokens()
        );
        let summaries: Vec<_> = h
            .messages()
            .iter()
            .filter(|m| categorize(m) == MessageCategory::HistorySummary)
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with(SUMMARY_PREFIX));
    }

    #[tokio::test]
    async fn compact_protects_newest_fifth_of_each_category() {
        let mut h = seeded_history(10_000);
        let newest_user = h
            .messages()
            .iter()
            .rev()
            .find(|m| categorize(m) == MessageCategory::UserSaid)
            .unwrap()
            .content
            .clone();
        h.compact(&StubSummarizer).await;
        assert!(
            h.messages().iter().any(|m| m.content == newest_user),
            "newest user message must survive compaction"
        );
    }

    #[tokio::test]
    async fn compact_keeps_tool_pairs_together() {
        let mut h = seeded_history(10_000);
        h.compact(&StubSummarizer).await;
        let pairs = pair_tool_calls(h.messages());
        for (i, m) in h.messages().iter().enumerate() {
            if m.item_type == ItemType::FunctionCall {
                assert!(
                    pairs.contains_key(&i),
                    "surviving call at {i} lost its output"
                );
            }
        }
        // And no orphaned outputs either.
        for (i, m) in h.messages().iter().enumerate() {
            if m.item_type == ItemType::FunctionCallOutput {
                assert!(
                    pairs.contains_key(&i),
                    "surviving output at {i} lost its call"
                );
            }
        }
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_truncation() {
        let mut h = seeded_history(10_000);
        let before = h.messages().len();
        let outcome = h.compact(&FailingSummarizer).await;
        match outcome {
            CompactionOutcome::Truncated { removed } => {
                assert!(removed > 0);
                assert_eq!(h.messages().len(), before - removed);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
        assert!(
            !h.messages()
                .iter()
                .any(|m| categorize(m) == MessageCategory::HistorySummary),
            "truncation fallback must not fabricate a summary"
        );
    }

    #[tokio::test]
    async fn compaction_leaves_minimum_messages() {
        let mut h = History::new("Magi", 1);
        for i in 0..6 {
            h.push(Message::assistant(format!("{i} {}", "w".repeat(4000))));
        }
        h.compact(&StubSummarizer).await;
        assert!(h.messages().len() >= MIN_REMAINING);
    }
}
