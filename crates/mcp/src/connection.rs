//! A single tool provider connection.
//!
//! Owns one child process speaking JSON-RPC 2.0 over newline-delimited
//! stdio. stdout carries protocol frames; stderr is diagnostic only and is
//! drained into our log. Requests are correlated by a locally incrementing
//! integer id through a shared pending map, and every request carries its
//! own timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ferrule_config::ToolProviderConfig;
use ferrule_core::error::McpError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    CallToolResult, ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, MCP_PROTOCOL_VERSION, ServerInfo, ServerMessage, ToolDescriptor,
    ToolsListResult, error_codes,
};

/// Default per-request timeout when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a clean exit before killing the process.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests waiting for their correlated response, shared with the reader.
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<crate::protocol::JsonRpcResponse>>>>;

/// An active session with one spawned tool provider process.
#[derive(Debug)]
pub struct Connection {
    name: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<BufWriter<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    call_timeout: Duration,
    tools: Vec<ToolDescriptor>,
    server_info: ServerInfo,
}

impl Connection {
    /// Spawn the provider process, run the initialize handshake, and cache
    /// its declared tools.
    pub async fn start(
        config: &ToolProviderConfig,
        call_timeout: Duration,
    ) -> Result<Self, McpError> {
        info!(provider = %config.name, command = %config.command, "Starting tool provider");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            provider: config.name.clone(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            provider: config.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            provider: config.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        spawn_reader_task(
            config.name.clone(),
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
        );
        if let Some(stderr) = stderr {
            spawn_stderr_task(config.name.clone(), BufReader::new(stderr));
        }

        let mut conn = Self {
            name: config.name.clone(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(BufWriter::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            call_timeout,
            tools: Vec::new(),
            server_info: ServerInfo::default(),
        };

        conn.handshake().await?;
        conn.discover_tools().await?;
        Ok(conn)
    }

    /// The configured provider name (tool namespace prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools declared by the provider at startup.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// What the provider reported about itself during the handshake.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Whether the process is still believed to be running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send a request and await its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Closed(format!(
                "provider '{}' is not running",
                self.name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Err(_) => {
                // Forget the id so a late response is dropped by the reader.
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    timeout_secs: self.call_timeout.as_secs(),
                })
            }
            Ok(Err(_)) => Err(McpError::Closed(format!(
                "provider '{}' exited with the request in flight",
                self.name
            ))),
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| McpError::Rpc { code: e.code, message: e.message }),
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.write_line(&JsonRpcNotification::new(method, params)).await
    }

    /// Call a tool by its provider-local name and extract a textual result.
    ///
    /// Text-typed content segments are concatenated; a result with no text
    /// segments falls back to a structural dump of the raw result.
    pub async fn call_tool(
        &self,
        raw_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        let params = serde_json::json!({ "name": raw_name, "arguments": arguments });
        let raw = self.request("tools/call", Some(params)).await?;
        let result: CallToolResult = serde_json::from_value(raw.clone())
            .map_err(|e| McpError::Protocol(format!("bad tools/call result: {e}")))?;

        let text = result.joined_text().unwrap_or_else(|| raw.to_string());
        if result.is_error {
            return Err(McpError::Rpc {
                code: error_codes::INTERNAL_ERROR,
                message: text,
            });
        }
        Ok(text)
    }

    /// Close the session: reject in-flight requests, shut the pipe, and
    /// reap (or kill) the process.
    pub async fn stop(&self) {
        self.alive.store(false, Ordering::Release);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        let mut child = self.child.lock().await;
        if let Some(ref mut child) = *child {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
                warn!(provider = %self.name, "Tool provider did not exit, killing");
                let _ = child.kill().await;
            }
        }
        *child = None;
        self.pending.lock().await.clear();
        debug!(provider = %self.name, "Tool provider stopped");
    }

    async fn handshake(&mut self) -> Result<(), McpError> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: "ferrule".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(&params).map_err(|e| McpError::Protocol(e.to_string()))?;
        let raw = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| McpError::Protocol(format!("bad initialize result: {e}")))?;

        if !init.protocol_version.is_empty() && init.protocol_version != MCP_PROTOCOL_VERSION {
            warn!(
                provider = %self.name,
                theirs = %init.protocol_version,
                ours = MCP_PROTOCOL_VERSION,
                "Tool provider reports a different protocol revision"
            );
        }
        self.server_info = init.server_info;

        self.notify("notifications/initialized", None).await?;
        info!(
            provider = %self.name,
            server = %self.server_info.name,
            version = %self.server_info.version,
            "Tool provider connected"
        );
        Ok(())
    }

    async fn discover_tools(&mut self) -> Result<(), McpError> {
        let raw = self.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(raw)
            .map_err(|e| McpError::Protocol(format!("bad tools/list result: {e}")))?;
        debug!(provider = %self.name, tools = list.tools.len(), "Discovered tools");
        self.tools = list.tools;
        Ok(())
    }

    async fn write_line<T: serde::Serialize>(&self, frame: &T) -> Result<(), McpError> {
        let line = serde_json::to_string(frame).map_err(|e| McpError::Protocol(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Read protocol frames from the provider's stdout and dispatch by id.
///
/// Process exit (EOF) or a read error marks the session dead and rejects
/// every pending request by dropping its sender.
fn spawn_reader_task(
    name: String,
    mut reader: BufReader<ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!(provider = %name, "Tool provider closed its output stream");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match ServerMessage::from_line(trimmed) {
                        Ok(ServerMessage::Response(response)) => {
                            let Some(id) = response.id.as_u64() else {
                                trace!(provider = %name, "Dropping response without numeric id");
                                continue;
                            };
                            let sender = pending.lock().await.remove(&id);
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                // Timed out or never ours; drop silently.
                                None => trace!(provider = %name, id, "Dropping unmatched response"),
                            }
                        }
                        Ok(ServerMessage::Notification(notification)) => {
                            debug!(
                                provider = %name,
                                method = %notification.method,
                                "Ignoring provider notification"
                            );
                        }
                        Err(e) => {
                            warn!(
                                provider = %name,
                                error = %e,
                                line = %trimmed,
                                "Unparseable line from tool provider"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Read error from tool provider");
                    break;
                }
            }
        }
        alive.store(false, Ordering::Release);
        pending.lock().await.clear();
    });
}

/// Tool providers log freely to stderr; forward it to our own log.
fn spawn_stderr_task(name: String, reader: BufReader<ChildStderr>) {
    tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(provider = %name, "stderr: {line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// A scripted MCP server speaking the same wire protocol as the real
    /// providers. Answers initialize, tools/list, and a handful of tools.
    const MOCK_SERVER: &str = r#"
import json, os, sys, time

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method", "")
    mid = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": mid, "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock-tools", "version": "0.1.0"}}})
    elif method == "notifications/initialized":
        pass
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": mid, "result": {"tools": [
            {"name": "echo", "description": "Echo text back",
             "inputSchema": {"type": "object",
                             "properties": {"text": {"type": "string"}},
                             "required": ["text"]}},
            {"name": "pair", "description": "Two text segments",
             "inputSchema": {"type": "object"}},
            {"name": "boom", "description": "Always fails",
             "inputSchema": {"type": "object"}},
            {"name": "env_probe", "description": "Report a test env var",
             "inputSchema": {"type": "object"}},
            {"name": "sleepy", "description": "Never answers in time",
             "inputSchema": {"type": "object"}}]}})
    elif method == "tools/call":
        name = msg["params"]["name"]
        args = msg["params"].get("arguments") or {}
        if name == "echo":
            send({"jsonrpc": "2.0", "id": mid, "result": {"content": [
                {"type": "text", "text": "echo: " + str(args.get("text", ""))}]}})
        elif name == "pair":
            send({"jsonrpc": "2.0", "id": mid, "result": {"content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}]}})
        elif name == "boom":
            send({"jsonrpc": "2.0", "id": mid, "result": {"content": [
                {"type": "text", "text": "it broke"}], "isError": True}})
        elif name == "env_probe":
            send({"jsonrpc": "2.0", "id": mid, "result": {"content": [
                {"type": "text", "text": os.environ.get("FERRULE_TEST_FLAG", "unset")}]}})
        elif name == "slow_echo":
            time.sleep(2)
            send({"jsonrpc": "2.0", "id": mid, "result": {"content": [
                {"type": "text", "text": "late"}]}})
        elif name == "sleepy":
            time.sleep(30)
        else:
            send({"jsonrpc": "2.0", "id": mid,
                  "error": {"code": -32602, "message": "unknown tool: " + name}})
    else:
        send({"jsonrpc": "2.0", "id": mid,
              "error": {"code": -32601, "message": "Method not found"}})
"#;

    async fn python3_available() -> bool {
        Command::new("python3").arg("--version").output().await.is_ok()
    }

    fn write_mock_server(dir: &Path) -> PathBuf {
        let path = dir.join("mock_server.py");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(MOCK_SERVER.as_bytes()).unwrap();
        path
    }

    fn mock_config(script: &Path) -> ToolProviderConfig {
        ToolProviderConfig {
            name: "mock".into(),
            command: "python3".into(),
            args: vec![script.to_string_lossy().into_owned()],
            env: StdHashMap::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn spawn_failure_names_the_provider() {
        let config = ToolProviderConfig {
            name: "ghost".into(),
            command: "/nonexistent/tool-server-binary".into(),
            args: vec![],
            env: StdHashMap::new(),
            enabled: true,
        };
        let err = Connection::start(&config, DEFAULT_CALL_TIMEOUT).await.unwrap_err();
        match err {
            McpError::Spawn { provider, .. } => assert_eq!(provider, "ghost"),
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_and_discovery() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());

        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn.name(), "mock");
        assert_eq!(conn.server_info().name, "mock-tools");
        assert!(conn.is_alive());

        let names: Vec<&str> = conn.tools().iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"sleepy"));

        conn.stop().await;
    }

    #[tokio::test]
    async fn call_tool_returns_text() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();

        let out = conn
            .call_tool("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "echo: hi");

        conn.stop().await;
    }

    #[tokio::test]
    async fn call_tool_concatenates_text_segments() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();

        let out = conn.call_tool("pair", serde_json::json!({})).await.unwrap();
        assert_eq!(out, "first\nsecond");

        conn.stop().await;
    }

    #[tokio::test]
    async fn error_flagged_result_fails_with_its_text() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();

        let err = conn.call_tool("boom", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("it broke"));

        conn.stop().await;
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();

        let err = conn.call_tool("nope", serde_json::json!({})).await.unwrap_err();
        match err {
            McpError::Rpc { code, message } => {
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert!(message.contains("unknown tool"));
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }

        conn.stop().await;
    }

    #[tokio::test]
    async fn env_is_passed_to_the_process() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let mut config = mock_config(&script);
        config.env.insert("FERRULE_TEST_FLAG".into(), "from-config".into());

        let conn = Connection::start(&config, DEFAULT_CALL_TIMEOUT).await.unwrap();
        let out = conn.call_tool("env_probe", serde_json::json!({})).await.unwrap();
        assert_eq!(out, "from-config");

        conn.stop().await;
    }

    #[tokio::test]
    async fn unresponsive_call_times_out_without_wedging() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), Duration::from_millis(800))
            .await
            .unwrap();

        let err = conn.call_tool("sleepy", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        // The pending map must not be wedged by the abandoned request.
        let err = conn.call_tool("sleepy", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        // The server is still blocked in its sleep; dropping the connection
        // kills the process instead of waiting out a graceful stop.
    }

    #[tokio::test]
    async fn late_response_is_dropped_silently() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), Duration::from_millis(500))
            .await
            .unwrap();

        let err = conn.call_tool("slow_echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(conn.pending.lock().await.is_empty());

        // Let the provider finish and emit the response nobody is waiting
        // for; the reader must drop it without disturbing later requests.
        tokio::time::sleep(Duration::from_millis(2200)).await;
        let out = conn
            .call_tool("echo", serde_json::json!({"text": "still here"}))
            .await
            .unwrap();
        assert_eq!(out, "echo: still here");

        conn.stop().await;
    }

    #[tokio::test]
    async fn requests_after_stop_are_rejected() {
        if !python3_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let conn = Connection::start(&mock_config(&script), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();

        conn.stop().await;
        let err = conn.call_tool("echo", serde_json::json!({"text": "x"})).await.unwrap_err();
        assert!(matches!(err, McpError::Closed(_)));
    }
}
