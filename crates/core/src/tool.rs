//! ToolBackend trait: the seam between the generation loop and tool execution.
//!
//! The loop asks the backend which tools exist, then dispatches calls by
//! flattened name. The production implementation aggregates out-of-process
//! tool providers (`ferrule-mcp`); tests use in-memory fakes.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;

/// Executes tools on behalf of the generation loop.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Every tool this backend can execute, in the shape the model expects.
    fn declared_tools(&self) -> Vec<ToolDefinition>;

    /// Whether `name` routes to a known tool.
    fn has_tool(&self, name: &str) -> bool;

    /// Execute a tool and return its textual output.
    ///
    /// Failures come back as errors; the caller decides how to surface them.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<String, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A minimal in-memory backend for trait-object tests.
    struct EchoBackend;

    #[async_trait]
    impl ToolBackend for EchoBackend {
        fn declared_tools(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "echo".into(),
                description: "Echoes back the input".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            }]
        }

        fn has_tool(&self, name: &str) -> bool {
            name == "echo"
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> std::result::Result<String, ToolError> {
            if name != "echo" {
                return Err(ToolError::NotFound(name.to_string()));
            }
            Ok(arguments["text"].as_str().unwrap_or("").to_string())
        }
    }

    #[tokio::test]
    async fn backend_works_as_trait_object() {
        let backend: Arc<dyn ToolBackend> = Arc::new(EchoBackend);
        assert!(backend.has_tool("echo"));
        assert!(!backend.has_tool("nonexistent"));
        assert_eq!(backend.declared_tools().len(), 1);

        let output = backend
            .call_tool("echo", serde_json::json!({"text": "hello world"}))
            .await
            .unwrap();
        assert_eq!(output, "hello world");
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let backend = EchoBackend;
        let err = backend
            .call_tool("nonexistent", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
