//! Textual tool call blocks.
//!
//! Models without native tool calling are taught to emit delimited blocks
//! inside their normal text output:
//!
//! ```text
//! <<<tool_call>>>
//! name: clock_time_now
//! arguments: {"timezone": "UTC"}
//! <<</tool_call>>>
//! ```
//!
//! This module finds complete blocks in streamed text, parses them into
//! calls, and strips the markup out of what the user sees. Arguments are
//! JSON when the model cooperates; otherwise a tolerant `key: value`
//! parser coerces each line into a JSON object field.

use serde_json::{json, Map, Value};
use std::ops::Range;

/// Current block delimiters.
pub const BLOCK_OPEN: &str = "<<<tool_call>>>";
pub const BLOCK_CLOSE: &str = "<<</tool_call>>>";

/// Legacy delimiters some fine-tunes still emit.
pub const LEGACY_OPEN: &str = "[TOOL_CALL]";
pub const LEGACY_CLOSE: &str = "[/TOOL_CALL]";

/// A tool call parsed out of a complete textual block.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// The requested tool name.
    pub name: String,

    /// Parsed arguments, always a JSON object.
    pub arguments: Value,

    /// The argument text as the model wrote it.
    pub raw_arguments: String,

    /// Byte range of the whole block (delimiters included) in the
    /// accumulated text.
    pub span: Range<usize>,
}

/// Find the earliest block opener at or after `from`, returning its start
/// offset and the delimiter pair it uses.
fn next_block(text: &str, from: usize) -> Option<(usize, &'static str, &'static str)> {
    let current = text[from..]
        .find(BLOCK_OPEN)
        .map(|i| (from + i, BLOCK_OPEN, BLOCK_CLOSE));
    let legacy = text[from..]
        .find(LEGACY_OPEN)
        .map(|i| (from + i, LEGACY_OPEN, LEGACY_CLOSE));

    match (current, legacy) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Parse every complete block in `text`, in order of appearance.
///
/// Blocks missing a tool name are skipped; an opener with no closer ends
/// the scan, since the block may still be streaming in.
pub fn find_complete_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some((start, open, close)) = next_block(text, cursor) {
        let body_start = start + open.len();
        let Some(rel) = text[body_start..].find(close) else {
            break;
        };
        let body = &text[body_start..body_start + rel];
        let span = start..body_start + rel + close.len();
        cursor = span.end;

        if let Some(call) = parse_block(body, span) {
            calls.push(call);
        }
    }

    calls
}

/// Whether `text` contains at least one complete block.
///
/// Cheap delimiter scan, no parsing. Used mid-stream to decide whether to
/// stop reading from the model.
pub fn has_complete_call(text: &str) -> bool {
    let mut cursor = 0;
    while let Some((start, open, close)) = next_block(text, cursor) {
        let body_start = start + open.len();
        if text[body_start..].contains(close) {
            return true;
        }
        cursor = body_start;
    }
    false
}

/// Offset just past the closer of the last complete block, if any.
pub fn last_complete_block_end(text: &str) -> Option<usize> {
    let mut cursor = 0;
    let mut last_end = None;

    while let Some((start, open, close)) = next_block(text, cursor) {
        let body_start = start + open.len();
        let Some(rel) = text[body_start..].find(close) else {
            break;
        };
        cursor = body_start + rel + close.len();
        last_end = Some(cursor);
    }

    last_end
}

/// Remove tool call markup from text destined for the user.
///
/// Complete blocks are spliced out; a trailing opener with no closer
/// truncates the output at the opener.
pub fn strip_tool_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some((start, open, close)) = next_block(text, cursor) {
        out.push_str(&text[cursor..start]);
        let body_start = start + open.len();
        match text[body_start..].find(close) {
            Some(rel) => cursor = body_start + rel + close.len(),
            // Open without close: everything from here on is protocol,
            // not prose.
            None => return out,
        }
    }

    out.push_str(&text[cursor..]);
    out
}

/// Trim a trailing partial opener so a delimiter being typed out never
/// reaches the display between chunks. Returns the safe prefix.
pub fn hold_back_partial_opener(text: &str) -> &str {
    for open in [BLOCK_OPEN, LEGACY_OPEN] {
        for len in (1..open.len()).rev() {
            if text.ends_with(&open[..len]) {
                return &text[..text.len() - len];
            }
        }
    }
    text
}

/// Parse the body of one block (text between the delimiters).
fn parse_block(body: &str, span: Range<usize>) -> Option<ParsedToolCall> {
    let mut name = String::new();
    for line in body.lines() {
        if let Some(rest) = line.trim().strip_prefix("name:") {
            name = rest.trim().to_string();
            break;
        }
    }
    if name.is_empty() {
        return None;
    }

    // Everything after "arguments:" belongs to the arguments, so JSON may
    // span multiple lines.
    let raw_arguments = body
        .find("arguments:")
        .map(|i| body[i + "arguments:".len()..].trim().to_string())
        .unwrap_or_default();

    let arguments = parse_arguments(&raw_arguments);

    Some(ParsedToolCall {
        name,
        arguments,
        raw_arguments,
        span,
    })
}

/// Parse argument text into a JSON object.
///
/// Valid JSON objects pass through. Anything else is read line by line as
/// `key: value` pairs with scalars coerced, so a model that forgets the
/// braces still gets its call through.
fn parse_arguments(raw: &str) -> Value {
    if raw.is_empty() {
        return json!({});
    }

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() {
            return value;
        }
    }

    let mut map = Map::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"').trim_matches('\'');
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), coerce_scalar(value.trim()));
    }
    Value::Object(map)
}

/// Coerce one scalar written without JSON quoting conventions.
fn coerce_scalar(raw: &str) -> Value {
    match raw {
        "true" => json!(true),
        "false" => json!(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                return Value::Number(n.into());
            }
            if let Ok(f) = raw.parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
            Value::String(unquoted.unwrap_or(raw).to_string())
        }
    }
}
