//! JSON-RPC 2.0 and MCP wire types for tool provider processes.
//!
//! Only the client-side subset of MCP is modeled here: the initialize
//! handshake, tool discovery, and tool calls. Every frame travels as one
//! line of JSON.

use serde::{Deserialize, Serialize};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in the initialize handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// A JSON-RPC 2.0 request (carries an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id`, fire and forget).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// The id this response correlates to. Defaults to null for malformed
    /// frames so the reader can drop them instead of failing.
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwrap into the result payload, or the error object.
    pub fn into_result(self) -> Result<serde_json::Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// An incoming line from a tool provider: either a response to one of our
/// requests or a server-initiated notification.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl ServerMessage {
    /// Classify one line of provider output.
    ///
    /// A frame with a `method` and no non-null `id` is a notification;
    /// everything else is treated as a response.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
        if has_method && !has_id {
            Ok(Self::Notification(serde_json::from_value(value)?))
        } else {
            Ok(Self::Response(serde_json::from_value(value)?))
        }
    }
}

// --- MCP handshake types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub server_info: ServerInfo,
}

// --- Tool discovery and calls ---

/// A tool descriptor from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments. Servers use either spelling.
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate the text-typed content segments (newline-joined), if any.
    pub fn joined_text(&self) -> Option<String> {
        let parts: Vec<&str> = self.content.iter().filter_map(ContentItem::as_text).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// One entry in a tool result's content list.
///
/// Only `text` items carry meaning for the loop; other kinds are kept
/// verbatim so callers can fall back to a structural dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" { self.text.as_deref() } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_id_and_version() {
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn response_success_roundtrip() {
        let line = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(line).unwrap();
        assert_eq!(resp.id.as_u64(), Some(3));
        assert!(!resp.is_error());
        let result = resp.into_result().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn response_error_surfaces() {
        let line = r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(line).unwrap();
        assert!(resp.is_error());
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
        assert!(err.to_string().contains("Method not found"));
    }

    #[test]
    fn server_message_classification() {
        let resp = ServerMessage::from_line(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(resp, ServerMessage::Response(_)));

        let note = ServerMessage::from_line(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert!(matches!(note, ServerMessage::Notification(_)));

        assert!(ServerMessage::from_line("not json").is_err());
    }

    #[test]
    fn initialize_params_use_camel_case() {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.into(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo { name: "ferrule".into(), version: "0.1.0".into() },
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("protocolVersion"));
        assert!(json.contains("clientInfo"));
        assert!(json.contains("2024-11-05"));
    }

    #[test]
    fn initialize_result_parses_server_info() {
        let raw = r#"{
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "clock-server", "version": "1.2.0"}
        }"#;
        let result: InitializeResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.protocol_version, "2024-11-05");
        assert_eq!(result.server_info.name, "clock-server");
    }

    #[test]
    fn tool_descriptor_accepts_both_schema_spellings() {
        let camel = r#"{"name":"time_now","inputSchema":{"type":"object"}}"#;
        let desc: ToolDescriptor = serde_json::from_str(camel).unwrap();
        assert_eq!(desc.input_schema["type"], "object");

        let snake = r#"{"name":"time_now","input_schema":{"type":"object"}}"#;
        let desc: ToolDescriptor = serde_json::from_str(snake).unwrap();
        assert_eq!(desc.input_schema["type"], "object");

        let neither = r#"{"name":"time_now"}"#;
        let desc: ToolDescriptor = serde_json::from_str(neither).unwrap();
        assert!(desc.input_schema.is_null());
    }

    #[test]
    fn call_result_joins_text_segments() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "second"}
            ]
        }"#;
        let result: CallToolResult = serde_json::from_str(raw).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text().unwrap(), "first\nsecond");
    }

    #[test]
    fn call_result_without_text_yields_none() {
        let raw = r#"{"content": [{"type": "image", "data": "..."}]}"#;
        let result: CallToolResult = serde_json::from_str(raw).unwrap();
        assert!(result.joined_text().is_none());
    }

    #[test]
    fn call_result_error_flag_parses() {
        let raw = r#"{"content":[{"type":"text","text":"boom"}],"isError":true}"#;
        let result: CallToolResult = serde_json::from_str(raw).unwrap();
        assert!(result.is_error);
        assert_eq!(result.joined_text().unwrap(), "boom");
    }
}
