//! DroidPilot CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Carry out one automation request on the device
//! - `config`  — Show, initialise or locate the config file
//! - `doctor`  — Check configuration and server reachability

use clap::{Parser, Subcommand};

mod commands;
mod observer;

#[derive(Parser)]
#[command(
    name = "droidpilot",
    about = "DroidPilot — oracle-driven Android automation",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one automation request
    Run {
        /// The request, e.g. "turn on airplane mode"; read from stdin if omitted
        query: Vec<String>,

        /// Override the device serial
        #[arg(short, long)]
        device: Option<String>,

        /// Override the iteration budget
        #[arg(short = 'n', long)]
        max_iterations: Option<u32>,

        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose configuration and server health
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Write a default config file if none exists
    Init,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Run {
            query,
            device,
            max_iterations,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                query,
                device,
                max_iterations,
                json,
            })
            .await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Init => commands::config_cmd::init().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
