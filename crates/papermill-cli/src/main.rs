//! `papermill`: inspect and maintain a Papermill data directory

mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use papermill_store::Namespace;

#[derive(Parser)]
#[command(
    name = "papermill",
    version,
    about = "Inspect and maintain a paper-ingestion data directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory; overrides the config's `data_dir`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    /// Run checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
    /// Result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// Entry and identifier counts
    Stats,
    /// One entry as JSON
    Show {
        /// Entry id (ULID)
        entry_id: String,
    },
    /// Entries recorded under a grouping
    Grouping {
        /// Grouping name
        name: String,
    },
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// Every stored run
    List,
    /// Completed items of one run
    Show {
        /// Run id
        run_id: String,
    },
    /// Delete a run's checkpoint so it starts over
    Clear {
        /// Run id
        run_id: String,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Delete expired and unreadable records
    Sweep,
    /// Delete every record of a namespace
    Clear {
        /// discovery, documents or analysis
        namespace: Namespace,
    },
    /// Record counts and sizes per namespace
    Stats,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Load and validate, then print the effective config
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_json);

    let config = commands::resolve_config(cli.config.as_deref(), cli.data_dir)?;
    tracing::debug!(data_dir = %config.data_dir.display(), "Resolved configuration");

    match cli.command {
        Commands::Registry { command } => match command {
            RegistryCommand::Stats => commands::registry::stats(&config).await,
            RegistryCommand::Show { entry_id } => commands::registry::show(&config, &entry_id).await,
            RegistryCommand::Grouping { name } => commands::registry::grouping(&config, &name).await,
        },
        Commands::Checkpoint { command } => match command {
            CheckpointCommand::List => commands::checkpoint::list(&config).await,
            CheckpointCommand::Show { run_id } => commands::checkpoint::show(&config, &run_id).await,
            CheckpointCommand::Clear { run_id } => commands::checkpoint::clear(&config, &run_id).await,
        },
        Commands::Cache { command } => match command {
            CacheCommand::Sweep => commands::cache::sweep(&config).await,
            CacheCommand::Clear { namespace } => commands::cache::clear(&config, namespace).await,
            CacheCommand::Stats => commands::cache::stats(&config).await,
        },
        Commands::Config { command } => match command {
            ConfigCommand::Check => commands::config::check(&config),
        },
    }
}
