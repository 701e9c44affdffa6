//! `ferrule config` — Configuration inspection commands.

use ferrule_config::AppConfig;

pub async fn summary() -> Result<(), Box<dyn std::error::Error>> {
    match AppConfig::load() {
        Ok(config) => {
            let mut warnings = Vec::new();

            if !config.has_api_key() {
                warnings.push(
                    "No API key set (set OPENROUTER_API_KEY or FERRULE_API_KEY env var)",
                );
            }

            if !config.mcp.providers.is_empty()
                && config.mcp.providers.iter().all(|p| !p.enabled)
            {
                warnings.push("Tool providers are configured but all of them are disabled");
            }

            if config.agent.display_throttle_ms == 0 {
                warnings.push("display_throttle_ms = 0 sends every streamed delta to the surface");
            }

            if !warnings.is_empty() {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:   {}", config.default_provider);
            println!("   Model:      {}", config.default_model);
            println!("   Protocol:   {}", config.agent.tool_protocol);
            println!("   Iterations: {}", config.agent.max_tool_iterations);
            println!("   Tools:      {} provider(s) configured", config.mcp.providers.len());
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    // Keys stay out of terminal scrollback.
    config.api_key = None;
    for provider in config.providers.values_mut() {
        provider.api_key = None;
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = ferrule_config::AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }
}
