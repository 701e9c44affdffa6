//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and get a response
//! back, either as a complete message or as a stream of classified deltas.
//!
//! Implementations: OpenAI-compatible endpoints (OpenRouter, OpenAI, Ollama,
//! vLLM, llama.cpp) and custom endpoints.

use crate::error::ProviderError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call (native tool protocol only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Provider-specific metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Fold another usage report into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A partial native tool call, tagged with the slot it belongs to.
///
/// Providers emit each tool call as a series of fragments; fragments sharing
/// an `index` belong to the same call, and their pieces are concatenated in
/// arrival order to reconstruct it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFragment {
    /// Which call slot this fragment extends
    pub index: u32,

    /// Call id, usually present only on the first fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Piece of the tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Piece of the argument JSON text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Partial reasoning delta (models with a separate thinking stream)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Partial native tool call fragments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallFragment>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage counters. Providers may report these more than once per call
    /// with cumulative values; the latest report wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The core Provider trait.
///
/// Every LLM backend implements this trait. The generation loop calls
/// `stream()` without knowing which provider is being used.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a
    /// single terminal chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let tool_calls = response
            .message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, tc)| ToolCallFragment {
                index: index as u32,
                id: Some(tc.id.clone()),
                name: Some(tc.name.clone()),
                arguments: Some(tc.arguments.clone()),
            })
            .collect();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content),
                thinking: None,
                tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }
}
