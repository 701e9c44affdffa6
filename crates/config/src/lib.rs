//! Configuration loading, validation, and management for Ferrule.
//!
//! Loads configuration from `~/.ferrule/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.ferrule/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Generation loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Tool provider (MCP) settings
    #[serde(default)]
    pub mcp: McpSettings,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("mcp", &self.mcp)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Settings for the generation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum model calls per reply before giving up on tools
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Tool call encoding: "auto", "native", or "textual"
    #[serde(default = "default_tool_protocol")]
    pub tool_protocol: String,

    /// Treat every model as natively tool-capable, overriding everything else
    #[serde(default)]
    pub force_native_tools: bool,

    /// Minimum milliseconds between progressive display updates
    #[serde(default = "default_display_throttle_ms")]
    pub display_throttle_ms: u64,
}

fn default_max_tool_iterations() -> u32 {
    10
}
fn default_tool_protocol() -> String {
    "auto".into()
}
fn default_display_throttle_ms() -> u64 {
    1500
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            tool_protocol: default_tool_protocol(),
            force_native_tools: false,
            display_throttle_ms: default_display_throttle_ms(),
        }
    }
}

/// Settings for out-of-process tool providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    /// Per-request timeout when talking to a tool provider
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Tool provider processes to spawn
    #[serde(default)]
    pub providers: Vec<ToolProviderConfig>,
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            providers: vec![],
        }
    }
}

/// One tool provider process: what to run and how.
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    /// Namespace prefix for this provider's tools
    pub name: String,

    /// Executable to spawn
    pub command: String,

    /// Arguments for the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether this provider is started at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for ToolProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Env values may carry tokens; show keys only.
        let env_keys: Vec<&str> = self.env.keys().map(|k| k.as_str()).collect();
        f.debug_struct("ToolProviderConfig")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.ferrule/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `FERRULE_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        if config.api_key.is_none() {
            config.api_key = std::env::var("FERRULE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        // Allow env var to override default provider
        if let Ok(provider) = std::env::var("FERRULE_PROVIDER") {
            config.default_provider = provider;
        }

        // Allow env var to override default model
        if let Ok(model) = std::env::var("FERRULE_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ferrule")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !matches!(self.agent.tool_protocol.as_str(), "auto" | "native" | "textual") {
            return Err(ConfigError::ValidationError(format!(
                "agent.tool_protocol must be one of auto, native, textual (got '{}')",
                self.agent.tool_protocol
            )));
        }

        if self.agent.max_tool_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_tool_iterations must be at least 1".into(),
            ));
        }

        if self.mcp.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "mcp.call_timeout_secs must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.mcp.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "mcp.providers entries must have a non-empty name".into(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool provider name '{}'",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentSettings::default(),
            mcp: McpSettings::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "openrouter");
        assert_eq!(config.agent.max_tool_iterations, 10);
        assert_eq!(config.agent.tool_protocol, "auto");
        assert_eq!(config.mcp.call_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.agent.max_tool_iterations, config.agent.max_tool_iterations);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_tool_protocol_rejected() {
        let mut config = AppConfig::default();
        config.agent.tool_protocol = "telepathy".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_tool_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_tool_provider_names_rejected() {
        let mut config = AppConfig::default();
        let provider = ToolProviderConfig {
            name: "clock".into(),
            command: "clock-server".into(),
            args: vec![],
            env: HashMap::new(),
            enabled: true,
        };
        config.mcp.providers = vec![provider.clone(), provider];
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.default_provider, "openrouter");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("auto"));
    }

    #[test]
    fn tool_provider_config_parsing() {
        let toml_str = r#"
default_model = "gpt-4o"

[agent]
max_tool_iterations = 5
tool_protocol = "textual"

[mcp]
call_timeout_secs = 10

[[mcp.providers]]
name = "clock"
command = "python3"
args = ["clock_server.py"]

[[mcp.providers]]
name = "files"
command = "files-server"
enabled = false
[mcp.providers.env]
FILES_ROOT = "/tmp/sandbox"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.agent.max_tool_iterations, 5);
        assert_eq!(config.agent.tool_protocol, "textual");
        assert_eq!(config.mcp.call_timeout_secs, 10);
        assert_eq!(config.mcp.providers.len(), 2);

        let clock = &config.mcp.providers[0];
        assert_eq!(clock.name, "clock");
        assert_eq!(clock.command, "python3");
        assert_eq!(clock.args, vec!["clock_server.py"]);
        assert!(clock.enabled);

        let files = &config.mcp.providers[1];
        assert!(!files.enabled);
        assert_eq!(files.env.get("FILES_ROOT").map(String::as_str), Some("/tmp/sandbox"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "default_provider = \"ollama\"").unwrap();
        writeln!(file, "default_model = \"llama3.2\"").unwrap();
        drop(file);

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider, "ollama");
        assert_eq!(config.default_model, "llama3.2");
        // Untouched sections fall back to defaults
        assert_eq!(config.agent.tool_protocol, "auto");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = AppConfig {
            api_key: Some("sk-secret-key".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }
}
