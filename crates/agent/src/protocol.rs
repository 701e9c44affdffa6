//! Tool protocol selection.
//!
//! Models differ in how they call tools. Native models emit structured
//! tool call deltas through the provider API; everything else gets a
//! prompt teaching it to emit delimited call blocks in plain text.
//!
//! Selection order: an explicit force flag, then the configured protocol,
//! then a model-name heuristic.

use crate::textual::{BLOCK_CLOSE, BLOCK_OPEN};
use ferrule_core::provider::ToolDefinition;

/// How tool calls travel between the model and the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolProtocol {
    /// Structured tool call fragments in the provider stream.
    Native,
    /// Delimited call blocks inside the generated text.
    Textual,
}

/// Model families known to support native tool calling.
///
/// Matched as substrings of the lowercased model name, so entries cover
/// whole families ("qwen" matches "qwen2.5-coder-32b-instruct").
const NATIVE_FAMILIES: &[&str] = &[
    "gpt-",
    "gpt4",
    "o1",
    "o3",
    "o4",
    "claude",
    "gemini",
    "qwen",
    "mistral",
    "mixtral",
    "deepseek",
    "llama-3",
    "llama3",
    "hermes",
    "command-r",
    "grok",
];

impl ToolProtocol {
    /// Parse a configured protocol name. `"auto"` (or anything unknown)
    /// yields `None`, which defers to the model heuristic.
    pub fn from_config(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" => Some(Self::Native),
            "textual" => Some(Self::Textual),
            _ => None,
        }
    }

    /// Guess the protocol from the model name.
    pub fn from_model(model: &str) -> Self {
        let lowered = model.to_ascii_lowercase();
        if NATIVE_FAMILIES.iter().any(|f| lowered.contains(f)) {
            Self::Native
        } else {
            Self::Textual
        }
    }

    /// Pick the protocol for a session.
    pub fn select(configured: Option<Self>, force_native: bool, model: &str) -> Self {
        if force_native {
            return Self::Native;
        }
        if let Some(protocol) = configured {
            return protocol;
        }
        Self::from_model(model)
    }
}

/// Build the system instruction that teaches a textual-protocol model
/// how to request tool calls.
pub fn tool_instruction(tools: &[ToolDefinition]) -> String {
    let mut out = String::from("You have access to the following tools:\n\n");

    for tool in tools {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        out.push_str(&format!("  parameters: {}\n", tool.parameters));
    }

    out.push_str(&format!(
        "\nTo call a tool, emit a block in exactly this form:\n\n\
         {open}\n\
         name: tool_name\n\
         arguments: {{\"key\": \"value\"}}\n\
         {close}\n\n\
         Put each block on its own lines. You may call several tools by \
         emitting several blocks. The results will be sent back to you, \
         after which you continue your answer. When no tool is needed, \
         answer directly without any block.",
        open = BLOCK_OPEN,
        close = BLOCK_CLOSE,
    ));

    out
}
