//! Ferrule CLI — the main entry point.
//!
//! Commands:
//! - `chat`   — Interactive chat or single-message mode
//! - `tools`  — List tools published by the configured tool providers
//! - `config` — Inspect the resolved configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "ferrule",
    about = "Ferrule — a tool-using conversational agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List the tools published by the configured tool providers
    Tools,

    /// Inspect the resolved configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Chat { message } => commands::chat::run(message).await?,
        Commands::Tools => commands::tools::run().await?,
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) => commands::config_cmd::show().await?,
            Some(ConfigAction::Path) => commands::config_cmd::path().await?,
            None => commands::config_cmd::summary().await?,
        },
    }

    Ok(())
}
