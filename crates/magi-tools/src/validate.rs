//! Tool-call validation: identity, registry resolution, argument parsing
//! (with repair of common model-side JSON mistakes), and schema checking.

use serde_json::Value;
use thiserror::Error;

use magi_model::ToolCallData;

#[derive(Debug, Error)]
pub enum ToolValidationError {
    #[error("tool call id is empty")]
    EmptyId,
    #[error("unsupported tool call kind '{0}'")]
    UnsupportedKind(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid JSON")]
    InvalidJson,
    #[error("arguments do not satisfy schema: {0}")]
    SchemaMismatch(String),
}

impl ToolValidationError {
    /// Render as the `function_call_output` payload for a rejected call.
    pub fn to_output(&self) -> String {
        serde_json::json!({ "error": self.to_string() }).to_string()
    }
}

/// Validate a call against a tool's schema.  Returns the parsed argument
/// object on success.
pub fn validate_call(
    call: &ToolCallData,
    schema: Option<&Value>,
) -> Result<Value, ToolValidationError> {
    if call.id.is_empty() {
        return Err(ToolValidationError::EmptyId);
    }
    if call.kind != "function" {
        return Err(ToolValidationError::UnsupportedKind(call.kind.clone()));
    }
    let Some(schema) = schema else {
        return Err(ToolValidationError::UnknownTool(call.function.name.clone()));
    };

    let raw = if call.function.arguments.trim().is_empty() {
        "{}"
    } else {
        call.function.arguments.as_str()
    };
    let args: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => repair_json(raw).ok_or(ToolValidationError::InvalidJson)?,
    };

    check_schema(&args, schema).map_err(ToolValidationError::SchemaMismatch)?;
    Ok(args)
}

/// Attempt to repair common model-side JSON mistakes before rejecting:
/// invalid escape sequences inside strings, and a truncated tail missing its
/// closing quote/brace.
fn repair_json(raw: &str) -> Option<Value> {
    let fixed = fix_invalid_escapes(raw);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }
    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        if completed.chars().filter(|&c| c == '"').count() % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }
    None
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash.  Valid JSON escapes are `" \ / b f n r t u`.
fn fix_invalid_escapes(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len() + 8);
    let mut chars = raw.chars();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Minimal JSON-Schema check: top-level type, required fields, per-property
/// primitive types, and enum membership.  Nested objects are checked
/// recursively through their `properties`.
fn check_schema(args: &Value, schema: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err("expected an object".into());
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if args.get(field).is_none() {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (name, prop_schema) in props {
        let Some(value) = args.get(name) else {
            continue;
        };
        if let Some(allowed) = prop_schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("'{name}' is not one of the allowed values"));
            }
        }
        if let Some(ty) = prop_schema.get("type").and_then(Value::as_str) {
            let ok = match ty {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("'{name}' has wrong type, expected {ty}"));
            }
            if ty == "object" {
                check_schema(value, prop_schema)?;
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
