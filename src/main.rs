mod repl;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use toolhub_core::config::AppConfig;
use toolhub_core::{llm, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "toolhub",
    about = "Chat with a language model backed by tools from MCP servers",
    version,
    author
)]
struct Cli {
    /// Path to config file (default: ~/.config/toolhub/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the model name
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Override the API base URL
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat (default)
    Chat,

    /// Start the HTTP server
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Connect to every provider, list their tools, and exit
    Tools,

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize default configuration file
    Init,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "toolhub=info,toolhub_core=info,toolhub_mcp=info,toolhub_server=info,warn".into()
        }))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    if let Some(model) = &cli.model {
        config.model.model = model.clone();
    }
    if let Some(api_base) = &cli.api_base {
        config.model.api_base = api_base.clone();
    }

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Config { action } => handle_config_command(action, &config)?,
        Commands::Serve { host, port } => {
            if let Some(h) = host {
                config.server.host = h;
            }
            if let Some(p) = port {
                config.server.port = p;
            }
            // The server stays up without providers and reports it per request.
            let orchestrator = start_orchestrator(&config, false).await?;
            toolhub_server::serve(config, orchestrator).await?;
        }
        Commands::Tools => {
            let mut orchestrator = start_orchestrator(&config, true).await?;
            repl::print_tools(&orchestrator);
            orchestrator.shutdown().await;
        }
        Commands::Chat => {
            let orchestrator = start_orchestrator(&config, true).await?;
            repl::run(&config, orchestrator).await?;
        }
    }

    Ok(())
}

/// Build the model, connect the configured providers, and index their tools.
async fn start_orchestrator(config: &AppConfig, require_providers: bool) -> Result<Orchestrator> {
    let model = llm::from_config(&config.model, config.system_prompt.clone())?;

    let timeout = Duration::from_secs(config.agent.request_timeout_secs);
    let report = toolhub_mcp::connect_all(&config.providers, timeout).await;
    for (name, err) in &report.failures {
        warn!("Skipping provider '{}': {}", name, err);
    }

    if require_providers && report.sessions.is_empty() {
        anyhow::bail!(
            "No tool providers connected ({} configured). Add [[providers]] entries to {}",
            config.providers.len(),
            AppConfig::default_path().display()
        );
    }

    let mut orchestrator = Orchestrator::from_config(model, &config.agent);
    for issue in orchestrator.initialize(report.sessions).await {
        warn!("Provider '{}': {}", issue.session_id, issue.message);
    }

    info!(
        "Connected to {} provider(s) exposing {} tools, model: {}",
        orchestrator.sessions().len(),
        orchestrator.registry().len(),
        config.model.model,
    );

    Ok(orchestrator)
}

fn handle_config_command(action: Option<ConfigAction>, config: &AppConfig) -> Result<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        Some(ConfigAction::Init) => {
            let path = AppConfig::default_path();
            if path.exists() {
                println!("Config already exists at: {}", path.display());
            } else {
                config.save()?;
                println!("Created default config at: {}", path.display());
            }
        }
        Some(ConfigAction::Path) => {
            println!("{}", AppConfig::default_path().display());
        }
    }
    Ok(())
}
