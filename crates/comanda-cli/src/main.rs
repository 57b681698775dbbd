//! Comanda CLI
//!
//! Operator console for the Comanda sync store: inspect, write and watch
//! the collections the ordering app works with.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use comanda_core::{Config, SyncStore};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "comanda")]
#[command(about = "Comanda - offline-first collection store for restaurant ordering")]
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
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a whole collection (remote first, then local cache)
    #[command(alias = "ls")]
    Get {
        /// Collection name (products, orders, coupons, ...)
        collection: String,
        /// JSON array returned when nothing is found anywhere
        #[arg(short, long)]
        default: Option<String>,
    },
    /// Show one record from the local cache
    Show {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },
    /// Merge fields into a record, creating it if needed
    Save {
        /// Collection name
        collection: String,
        /// Fields as a JSON object
        fields: String,
        /// Record ID (a random one is generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Remove a record
    #[command(alias = "rm")]
    Remove {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },
    /// Print the collection every time it changes, until Ctrl-C
    Watch {
        /// Collection name
        collection: String,
    },
    /// Show store status (mirroring, storage)
    Status,
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
        /// Configuration key (data_dir, remote_url, remote_enabled, cache_prefix, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands must work even with a broken data dir or remote
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let store = SyncStore::open(&config).await;

    match cli.command {
        Commands::Get {
            collection,
            default,
        } => commands::records::get(&store, &collection, default.as_deref(), &output).await,
        Commands::Show { collection, id } => {
            commands::records::show(&store, &collection, &id, &output)
        }
        Commands::Save {
            collection,
            fields,
            id,
        } => commands::records::save(&store, &collection, id, &fields, &output).await,
        Commands::Remove { collection, id } => {
            commands::records::remove(&store, &collection, &id, &output).await
        }
        Commands::Watch { collection } => commands::watch::watch(&store, &collection, &output).await,
        Commands::Status => commands::status::show(&store, &config, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
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
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
    }
}

/// Initialize logging
///
/// Only initializes if COMANDA_LOG environment variable is set.
/// Logs to config.log_file when set, stderr otherwise.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("COMANDA_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "comanda_core={},comanda_cli={}",
        log_level, log_level
    ));

    match &config.log_file {
        Some(log_path) => {
            let log_file = match File::create(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
                    return;
                }
            };

            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();

            info!("Logging initialized to {:?}", log_path);
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
