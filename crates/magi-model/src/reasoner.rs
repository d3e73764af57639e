//! Request/response rewriting for reasoning models that cannot accept tool
//! schemas (deepseek-reasoner).
//!
//! The request side serializes the tool list into a trailing system message
//! and flattens prior tool interactions into plain text.  The response side
//! scans the final text for a `TOOL_CALLS: [...]` trailer and converts it
//! back into structured tool calls.

use serde_json::Value;

use crate::{Conversation, ItemType, Message, Role, ToolCallData, ToolSchema};

/// Models routed through the fallback instead of native tool calling.
pub fn is_reasoner_model(model: &str) -> bool {
    model.starts_with("deepseek-reasoner")
}

/// Rewrite a conversation for a tool-incapable reasoning model.
///
/// Produces a message list where:
/// - all `system` content is consolidated at the head,
/// - prior assistant tool calls appear as `[Previous Action]` text,
/// - prior tool results appear as `[Tool Result for <id>]` user text,
/// - the tool list (if any) is appended to the system head with the
///   `TOOL_CALLS:` protocol instructions,
/// - no two consecutive messages share a role, and
/// - the final message is `user`.
pub fn prepare_reasoner_messages(
    conversation: &Conversation,
    tools: &[ToolSchema],
) -> Vec<Message> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut body: Vec<Message> = Vec::new();

    for msg in &conversation.messages {
        match (msg.role, msg.item_type) {
            (Role::System, _) | (Role::Developer, _) => {
                if let Some(c) = &msg.content {
                    system_parts.push(c.clone());
                }
            }
            (_, ItemType::FunctionCall) => {
                let name = msg.name.as_deref().unwrap_or("unknown");
                let args = msg.arguments.as_deref().unwrap_or("{}");
                body.push(Message::assistant(format!(
                    "[Previous Action] Called '{name}' with args: {args}"
                )));
            }
            (_, ItemType::FunctionCallOutput) => {
                let id = msg.call_id.as_deref().unwrap_or("unknown");
                let out = msg.output.as_deref().unwrap_or("");
                body.push(Message::user(format!("[Tool Result for {id}] {out}")));
            }
            (_, ItemType::Thinking) => {
                // Reasoning models regenerate their own chain of thought;
                // prior thinking is dropped rather than replayed.
            }
            (role, ItemType::Message) => {
                if let Some(c) = &msg.content {
                    let role = if role == Role::Assistant {
                        Role::Assistant
                    } else {
                        Role::User
                    };
                    body.push(match role {
                        Role::Assistant => Message::assistant(c.clone()),
                        _ => Message::user(c.clone()),
                    });
                }
            }
        }
    }

    if !tools.is_empty() {
        system_parts.push(render_tool_protocol(tools));
    }

    // Merge adjacent same-role messages.
    let mut merged: Vec<Message> = Vec::with_capacity(body.len());
    for msg in body {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                let joined = format!(
                    "{}\n\n{}",
                    prev.content.as_deref().unwrap_or(""),
                    msg.content.as_deref().unwrap_or("")
                );
                prev.content = Some(joined);
            }
            _ => merged.push(msg),
        }
    }

    // The API requires the exchange to end on a user turn.
    if !matches!(merged.last(), Some(m) if m.role == Role::User) {
        merged.push(Message::user("Continue."));
    }

    let mut result = Vec::with_capacity(merged.len() + 1);
    if !system_parts.is_empty() {
        result.push(Message::system(system_parts.join("\n\n")));
    }
    result.extend(merged);
    result
}

fn render_tool_protocol(tools: &[ToolSchema]) -> String {
    let listing = tools
        .iter()
        .map(|t| {
            format!(
                "- {}: {}\n  parameters: {}",
                t.name, t.description, t.parameters
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You can call the following tools:\n{listing}\n\n\
         To call one or more tools, finish your reply with a single line of \
         the form:\n\
         TOOL_CALLS: [{{\"id\": \"call_1\", \"function\": {{\"name\": \"tool_name\", \
         \"arguments\": \"{{...}}\"}}}}]\n\
         The line must be the last line of your reply, the value must be a \
         JSON array, and every entry needs a unique \"id\". If you do not \
         want to call a tool, do not emit the line at all."
    )
}

/// Extract a `TOOL_CALLS: [...]` trailer from reasoner output.
///
/// Returns `(cleaned_text, calls)` when a trailer parses, `None` otherwise.
/// Some models wrap the trailer in a fenced code block and some do not, so
/// the text is first stripped of a trailing fence; the trailer itself is
/// matched with `(?s)(?:^|\n)\s*TOOL_CALLS:\s*(\[.*\])\s*$`.
pub fn parse_reasoner_tool_calls(text: &str) -> Option<(String, Vec<ToolCallData>)> {
    let unfenced = strip_trailing_fence(text);
    let re = regex::Regex::new(r"(?s)(?:^|\n)\s*TOOL_CALLS:\s*(\[.*\])\s*$").ok()?;
    let caps = re.captures(&unfenced)?;
    let json_span = caps.get(1)?;
    let entries: Vec<Value> = serde_json::from_str(json_span.as_str()).ok()?;

    let mut calls = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let name = entry["function"]["name"].as_str()?.to_string();
        let id = entry["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("reasoner_call_{i}"));
        // arguments may arrive as an encoded string or an inline object.
        let arguments = match &entry["function"]["arguments"] {
            Value::String(s) => s.clone(),
            Value::Null => "{}".to_string(),
            other => other.to_string(),
        };
        calls.push(ToolCallData::function(id, name, arguments));
    }
    if calls.is_empty() {
        return None;
    }

    let cleaned = unfenced[..caps.get(0).map(|m| m.start()).unwrap_or(0)]
        .trim_end()
        .to_string();
    Some((cleaned, calls))
}

/// Remove a trailing ``` fence that wraps the tail of the text, keeping the
/// fenced content in place.  Leading text before the fence is preserved.
fn strip_trailing_fence(text: &str) -> String {
    let trimmed = text.trim_end();
    let Some(without_close) = trimmed.strip_suffix("```") else {
        return text.to_string();
    };
    // Find the opening fence of that final block.
    let Some(open) = without_close.rfind("```") else {
        return text.to_string();
    };
    let mut inner = &without_close[open + 3..];
    // Drop an optional language tag on the opening fence line.
    if let Some(nl) = inner.find('\n') {
        let first_line = &inner[..nl];
        if !first_line.contains(':') && first_line.len() <= 16 {
            inner = &inner[nl + 1..];
        }
    }
    format!("{}{}", &without_close[..open], inner.trim_end())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: "test tool".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn tool_heavy_conversation() -> Conversation {
        let call = ToolCallData::function("c1", "add", r#"{"a":1,"b":2}"#);
        Conversation::from_messages(vec![
            Message::system("You are Magi."),
            Message::user("add one and two"),
            Message::function_call(&call),
            Message::function_call_output("c1", "3"),
            Message::assistant("It is 3."),
        ])
    }

    #[test]
    fn first_message_is_consolidated_system() {
        let msgs = prepare_reasoner_messages(&tool_heavy_conversation(), &[schema("add")]);
        assert_eq!(msgs[0].role, Role::System);
        let sys = msgs[0].content.as_deref().unwrap();
        assert!(sys.contains("You are Magi."));
        assert!(sys.contains("TOOL_CALLS:"));
        assert!(msgs[1..].iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn last_message_is_user() {
        let msgs = prepare_reasoner_messages(&tool_heavy_conversation(), &[]);
        assert_eq!(msgs.last().unwrap().role, Role::User);
    }

    #[test]
    fn no_consecutive_same_role_messages() {
        let msgs = prepare_reasoner_messages(&tool_heavy_conversation(), &[]);
        for pair in msgs.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "adjacent same-role messages");
        }
    }

    #[test]
    fn tool_interactions_flattened_to_text() {
        let msgs = prepare_reasoner_messages(&tool_heavy_conversation(), &[]);
        let all_text: String = msgs
            .iter()
            .filter_map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(all_text.contains("[Previous Action] Called 'add'"));
        assert!(all_text.contains("[Tool Result for c1] 3"));
    }

    #[test]
    fn parse_bare_trailer() {
        let text = "I will add the numbers now.\nTOOL_CALLS: [{\"id\":\"c1\",\"function\":{\"name\":\"add\",\"arguments\":\"{\\\"a\\\":1}\"}}]";
        let (cleaned, calls) = parse_reasoner_tool_calls(text).unwrap();
        assert_eq!(cleaned, "I will add the numbers now.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "add");
        assert_eq!(calls[0].function.arguments, r#"{"a":1}"#);
    }

    #[test]
    fn parse_fenced_trailer() {
        let text = "Working on it.\n```json\nTOOL_CALLS: [{\"id\":\"x\",\"function\":{\"name\":\"go\",\"arguments\":{}}}]\n```";
        let (cleaned, calls) = parse_reasoner_tool_calls(text).unwrap();
        assert_eq!(cleaned, "Working on it.");
        assert_eq!(calls[0].function.name, "go");
        assert_eq!(calls[0].function.arguments, "{}");
    }

    #[test]
    fn object_arguments_reencoded_as_string() {
        let text = r#"TOOL_CALLS: [{"id":"1","function":{"name":"f","arguments":{"k":"v"}}}]"#;
        let (_, calls) = parse_reasoner_tool_calls(text).unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"k":"v"}"#);
    }

    #[test]
    fn missing_id_gets_synthesized() {
        let text = r#"TOOL_CALLS: [{"function":{"name":"f","arguments":"{}"}}]"#;
        let (_, calls) = parse_reasoner_tool_calls(text).unwrap();
        assert_eq!(calls[0].id, "reasoner_call_0");
    }

    #[test]
    fn plain_text_yields_none() {
        assert!(parse_reasoner_tool_calls("Just a normal answer.").is_none());
        assert!(parse_reasoner_tool_calls("TOOL_CALLS: not json").is_none());
    }

    #[test]
    fn trailer_must_be_at_end() {
        let text = "TOOL_CALLS: [{\"id\":\"1\",\"function\":{\"name\":\"f\",\"arguments\":\"{}\"}}]\nBut then I kept talking.";
        assert!(parse_reasoner_tool_calls(text).is_none());
    }
}
