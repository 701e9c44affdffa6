//! Error types for the Ferrule domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Ferrule operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Tool transport errors ---
    #[error("Tool provider error: {0}")]
    Mcp(#[from] McpError),

    // --- Display errors ---
    #[error("Display error: {0}")]
    Display(#[from] DisplayError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not registered: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// Transport-level failures talking to a tool provider process.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn tool provider '{provider}': {reason}")]
    Spawn { provider: String, reason: String },

    #[error("Tool provider connection closed: {0}")]
    Closed(String),

    #[error("Tool provider request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Tool provider returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool provider protocol error: {0}")]
    Protocol(String),

    #[error("Tool provider I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Display update failed: {0}")]
    UpdateFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::ExecutionFailed {
            tool_name: "files_read".into(),
            reason: "no such file".into(),
        });
        assert!(err.to_string().contains("files_read"));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn unknown_tool_reads_as_not_registered() {
        let err = ToolError::NotFound("weather_lookup".into());
        assert!(err.to_string().contains("not registered"));
        assert!(err.to_string().contains("weather_lookup"));
    }

    #[test]
    fn mcp_error_wraps_into_top_level() {
        let err = Error::from(McpError::Timeout { timeout_secs: 30 });
        assert!(err.to_string().contains("timed out after 30s"));
    }

    #[test]
    fn io_error_converts_to_mcp_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = McpError::from(io);
        assert!(matches!(err, McpError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
