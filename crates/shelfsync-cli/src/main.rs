//! Shelfsync CLI
//!
//! Command-line interface for shelfsync - inspect and drive the reading-state
//! sync queue.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shelfsync_core::{Config, SyncSession};

mod commands;
mod http;
mod output;

use output::{Output, OutputFormat};

/// Environment variable holding the log level
const LOG_ENV: &str = "SHELFSYNC_LOG";

#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(about = "shelfsync - Offline-first reading state sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status from local state
    Status,
    /// List queued and parked changes
    Queue,
    /// Send queued changes and refresh from the server once
    Sync,
    /// Keep syncing in the foreground until Ctrl-C
    Watch,
    /// Re-queue changes that gave up after repeated failures
    Retry {
        /// Drop parked changes instead of re-queuing them
        #[arg(long)]
        discard: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_url, sync_enabled, log_file, sync.*)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands don't open the session
    let command = match cli.command {
        Commands::Config { command } => {
            return handle_config_command(command, config_path, &output);
        }
        command => command,
    };

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let session = Arc::new(SyncSession::open_with_config(&config)?);

    match command {
        Commands::Status => commands::status::show(&session, &config, &output),
        Commands::Queue => commands::queue::list(&session, &output),
        Commands::Sync => commands::sync::sync(session, &config, &output).await,
        Commands::Watch => commands::sync::watch(session, &config, &output).await,
        Commands::Retry { discard } => commands::retry::retry(&session, discard, &output),
        Commands::Config { command } => handle_config_command(command, config_path, &output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
        Some(ConfigCommands::Path) => commands::config::path(config_path),
    }
}

/// Initialize logging
///
/// Only initializes if SHELFSYNC_LOG is set. Logs go to `config.log_file`
/// when configured, stderr otherwise.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var(LOG_ENV) else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "shelfsync_core={},shelfsync_cli={}",
        log_level, log_level
    ));

    match &config.log_file {
        Some(path) => {
            let log_file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
            info!("Logging initialized to {:?}", path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
