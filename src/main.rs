//! Causerie CLI
//!
//! Commands:
//!   chat - Chat with the configured model (default)
//!   init - Choose model, device and token window
//!   config - Show the effective configuration
//!   info - Show model, cache and budget info

use anyhow::{Context, Result};
use causerie::llm::candle::{is_cached, load_backend};
use causerie::{block_on_detached, run_init, run_repl, show_welcome, Config, InitResult};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "causerie")]
#[command(about = "Chat with a local language model")]
#[command(version)]
struct Cli {
    /// Override max total tokens for this run
    #[arg(long)]
    max_total_tokens: Option<usize>,

    /// Override tokens reserved for replies for this run
    #[arg(long)]
    max_response_tokens: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the configured model
    Chat,

    /// Run initialization flow (re-configure model, device, window)
    Init {
        /// Use the default configuration without prompts (for CI/scripting)
        #[arg(long)]
        default: bool,
    },

    /// Show the effective configuration as TOML
    Config,

    /// Show model info
    Info,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "causerie=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // A reply still generating at quit must not hold the process open
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    block_on_detached(runtime, run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None | Some(Commands::Chat) => {
            let mut config = match Config::load()? {
                Some(config) => config,
                None => {
                    // First run - run init
                    show_welcome();
                    match run_init(None)? {
                        InitResult::Configured(config) => {
                            println!("\n{} Configuration saved!\n", "✓".green());
                            config
                        }
                        InitResult::Cancelled => {
                            println!("\nSetup cancelled.");
                            return Ok(());
                        }
                    }
                }
            };
            if let Some(total) = cli.max_total_tokens {
                config.window.max_total_tokens = total;
            }
            if let Some(response) = cli.max_response_tokens {
                config.window.max_response_tokens = response;
            }
            // Fail before the download, not after
            config.validate()?;

            println!("Loading model...");
            let backend = load_backend(&config, true)?;
            run_repl(backend, config).await?;
        }

        Some(Commands::Init { default }) => {
            if default {
                let config = Config::default();
                config.save()?;
                println!("{} Default configuration saved to {}", "✓".green(), Config::path()?.display());
            } else {
                let existing = Config::load()?;
                match run_init(existing.as_ref())? {
                    InitResult::Configured(_) => {
                        println!("\n{} Configuration saved!", "✓".green());
                    }
                    InitResult::Cancelled => {
                        println!("\nCancelled. Configuration unchanged.");
                    }
                }
            }
        }

        Some(Commands::Config) => {
            let config = Config::load_or_default()?;
            println!("# {}", Config::path()?.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }

        Some(Commands::Info) => {
            let config = Config::load_or_default()?;
            let window = config.window.window()?;

            println!("Causerie v{}\n", env!("CARGO_PKG_VERSION"));
            println!("Model:");
            println!("  Name:     {}", config.model.name());
            println!("  Repo:     {}", config.model.hf_id());
            println!("  Context:  {} tokens", config.model.context_length());
            println!(
                "  Cached:   {}",
                if is_cached(&config.model) { "yes".green() } else { "no".yellow() }
            );
            println!("  Device:   {}", config.device.name());
            println!();
            println!("Window:");
            println!("  Total:    {} tokens", window.max_total_tokens());
            println!("  Replies:  {} tokens", window.max_response_tokens());
            println!("  History:  {} tokens", window.budget());
        }
    }

    Ok(())
}
