//! `ferrule tools` — list every tool the configured providers publish.

use ferrule_config::AppConfig;
use ferrule_mcp::ToolSubstrate;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.mcp.providers.is_empty() {
        println!();
        println!("  No tool providers configured.");
        println!();
        println!(
            "  Add one to {}:",
            AppConfig::config_dir().join("config.toml").display()
        );
        println!();
        println!("    [[mcp.providers]]");
        println!("    name = \"clock\"");
        println!("    command = \"python3\"");
        println!("    args = [\"clock_server.py\"]");
        println!();
        return Ok(());
    }

    let mut substrate = ToolSubstrate::new();
    substrate.initialize(&config.mcp).await;

    let declared = substrate.declared_tools();
    println!();
    println!(
        "  {} tool(s) from {} provider(s)",
        declared.len(),
        substrate.provider_count()
    );
    println!();
    for tool in &declared {
        println!("  {}", tool.name);
        if !tool.description.is_empty() {
            println!("      {}", tool.description);
        }
        if let Ok(schema) = serde_json::to_string(&tool.parameters) {
            println!("      parameters: {schema}");
        }
        println!();
    }

    substrate.dispose().await;
    Ok(())
}
