//! Aggregates every configured tool provider into one flat tool namespace.
//!
//! Each enabled provider gets its own [`Connection`]; tools are republished
//! under `provider_tool` names so the generation loop sees a single
//! registry. A provider that fails to start is logged and skipped, so one
//! broken server never takes down the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferrule_config::McpSettings;
use ferrule_core::error::{McpError, ToolError};
use ferrule_core::provider::ToolDefinition;
use ferrule_core::tool::ToolBackend;
use tracing::{debug, info, warn};

use crate::connection::{Connection, DEFAULT_CALL_TIMEOUT};

/// Routes a flattened tool name back to its owning provider.
#[derive(Debug, Clone)]
struct ToolRoute {
    provider: String,
    raw_name: String,
}

/// Owns one [`Connection`] per enabled tool provider and publishes the union
/// of their tools.
pub struct ToolSubstrate {
    connections: HashMap<String, Arc<Connection>>,
    routes: HashMap<String, ToolRoute>,
    declared: Vec<ToolDefinition>,
    call_timeout: Duration,
}

/// Flatten a provider-local tool name into the shared namespace.
fn flatten_name(provider: &str, tool: &str) -> String {
    format!("{provider}_{tool}")
}

impl ToolSubstrate {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            routes: HashMap::new(),
            declared: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Start every enabled provider from the settings.
    ///
    /// Failures are logged and skipped; the substrate comes up with
    /// whatever subset connected successfully.
    pub async fn initialize(&mut self, settings: &McpSettings) {
        self.call_timeout = Duration::from_secs(settings.call_timeout_secs);
        for provider in &settings.providers {
            if !provider.enabled {
                debug!(provider = %provider.name, "Tool provider disabled, skipping");
                continue;
            }
            match Connection::start(provider, self.call_timeout).await {
                Ok(connection) => self.register(connection),
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "Tool provider failed to start, skipping");
                }
            }
        }
        info!(
            providers = self.connections.len(),
            tools = self.declared.len(),
            "Tool substrate ready"
        );
    }

    /// Number of running provider connections.
    pub fn provider_count(&self) -> usize {
        self.connections.len()
    }

    /// Every flattened tool, in the shape the model expects.
    pub fn declared_tools(&self) -> Vec<ToolDefinition> {
        self.declared.clone()
    }

    /// Whether `name` routes to a known tool.
    pub fn has_tool(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Execute a flattened tool name through its owning connection.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let route = self
            .routes
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let connection = self
            .connections
            .get(&route.provider)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        connection
            .call_tool(&route.raw_name, arguments)
            .await
            .map_err(|e| match e {
                McpError::Timeout { timeout_secs } => ToolError::Timeout {
                    tool_name: name.to_string(),
                    timeout_secs,
                },
                other => ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    /// Stop every provider connection.
    pub async fn dispose(&self) {
        for (name, connection) in &self.connections {
            debug!(provider = %name, "Stopping tool provider");
            connection.stop().await;
        }
    }

    fn register(&mut self, connection: Connection) {
        let provider = connection.name().to_string();
        for tool in connection.tools() {
            let flat = flatten_name(&provider, &tool.name);
            if self.routes.contains_key(&flat) {
                warn!(tool = %flat, "Duplicate flattened tool name, keeping the first");
                continue;
            }
            // Providers may omit the schema; the model still needs an object.
            let parameters = if tool.input_schema.is_null() {
                serde_json::json!({ "type": "object", "properties": {} })
            } else {
                tool.input_schema.clone()
            };
            self.routes.insert(
                flat.clone(),
                ToolRoute { provider: provider.clone(), raw_name: tool.name.clone() },
            );
            self.declared.push(ToolDefinition {
                name: flat,
                description: tool.description.clone().unwrap_or_default(),
                parameters,
            });
        }
        debug!(provider = %provider, tools = connection.tools().len(), "Registered tool provider");
        self.connections.insert(provider, Arc::new(connection));
    }
}

impl Default for ToolSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolBackend for ToolSubstrate {
    fn declared_tools(&self) -> Vec<ToolDefinition> {
        ToolSubstrate::declared_tools(self)
    }

    fn has_tool(&self, name: &str) -> bool {
        ToolSubstrate::has_tool(self, name)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        ToolSubstrate::call_tool(self, name, arguments).await
    }
}
