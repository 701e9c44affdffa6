//! `ferrule chat` — Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use ferrule_agent::{AgentLoop, ToolProtocol};
use ferrule_config::AppConfig;
use ferrule_core::error::DisplayError;
use ferrule_core::event::EventBus;
use ferrule_core::message::{Conversation, Message};
use ferrule_core::DisplaySink;
use ferrule_mcp::ToolSubstrate;
use tokio::io::AsyncBufReadExt;

/// Renders one evolving reply in the terminal.
///
/// Progressive updates become a character counter on stderr so partial
/// text never interleaves with the prompt; the final text lands on stdout.
struct TerminalSink;

#[async_trait::async_trait]
impl DisplaySink for TerminalSink {
    async fn update(&self, text: &str) -> Result<(), DisplayError> {
        eprint!("\r  … {} chars", text.chars().count());
        let _ = std::io::stderr().flush();
        Ok(())
    }

    async fn finalize(&self, text: &str) -> Result<(), DisplayError> {
        // Clear the progress line before printing the reply.
        eprint!("\r\x1b[2K");
        let _ = std::io::stderr().flush();
        println!();
        for line in text.lines() {
            println!("  Assistant > {line}");
        }
        println!();
        Ok(())
    }
}

fn is_exit_word(input: &str) -> bool {
    matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q")
}

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for API key early — give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (recommended)");
        eprintln!("    OPENAI_API_KEY=sk-...             (for OpenAI direct)");
        eprintln!("    FERRULE_API_KEY=sk-...            (generic)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        eprintln!("  Get an OpenRouter key at: https://openrouter.ai/keys");
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    // Build provider from config
    let router = ferrule_providers::build_from_config(&config);
    let provider = router.default().ok_or("No default provider configured")?;

    // Spawn the configured tool providers
    let mut substrate = ToolSubstrate::new();
    substrate.initialize(&config.mcp).await;
    let substrate = Arc::new(substrate);

    let protocol = ToolProtocol::select(
        ToolProtocol::from_config(&config.agent.tool_protocol),
        config.agent.force_native_tools,
        &config.default_model,
    );

    let event_bus = Arc::new(EventBus::default());
    let agent = AgentLoop::new(
        provider,
        &config.default_model,
        config.default_temperature,
        substrate.clone(),
        protocol,
        event_bus,
    )
    .with_max_iterations(config.agent.max_tool_iterations)
    .with_max_tokens(config.default_max_tokens)
    .with_display_interval(Duration::from_millis(config.agent.display_throttle_ms));

    let sink: Arc<dyn DisplaySink> = Arc::new(TerminalSink);

    if let Some(msg) = message {
        // Single message mode: the sink prints the reply.
        let mut conv = Conversation::new();
        conv.push(Message::user(&msg));
        if let Err(e) = agent.process(&mut conv, sink).await {
            substrate.dispose().await;
            return Err(format!("Generation failed: {e}").into());
        }
    } else {
        // Interactive mode
        println!();
        println!("  ╔══════════════════════════════════════════════╗");
        println!("  ║       Ferrule Agent — Interactive Mode       ║");
        println!("  ╚══════════════════════════════════════════════╝");
        println!();
        println!("  Provider:  {}", config.default_provider);
        println!("  Model:     {}", config.default_model);
        println!("  Protocol:  {protocol:?} tool calls");
        println!(
            "  Tools:     {} from {} provider(s)",
            substrate.declared_tools().len(),
            substrate.provider_count()
        );
        println!();
        println!("  Type your message and press Enter.");
        println!("  Type 'exit' or Ctrl+C to quit.");
        println!();

        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut conv = Conversation::new();

        print!("  You > ");
        std::io::stdout().flush()?;

        while let Some(line) = lines.next_line().await? {
            let input = line.trim();
            if input.is_empty() {
                print!("  You > ");
                std::io::stdout().flush()?;
                continue;
            }
            if is_exit_word(input) {
                break;
            }

            conv.push(Message::user(input));
            if let Err(e) = agent.process(&mut conv, sink.clone()).await {
                eprintln!("  [Error] {e}");
                println!();
            }

            print!("  You > ");
            std::io::stdout().flush()?;
        }

        println!();
        println!("  Goodbye! 👋");
        println!();
    }

    substrate.dispose().await;
    Ok(())
}
