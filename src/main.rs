mod capture;
mod catalog;
mod checkpoint;
mod commands;
mod db;
mod engine;
mod error;
mod indexer;
mod install;
mod query;
mod render;
mod schema;
mod settings;
mod transform;
mod tree;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::{EnvFilter, fmt};

use crate::commands::BootstrapArgs;
use crate::error::ConfigError;
use crate::settings::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Schema document path; falls back to the SCHEMA environment variable
    #[arg(long, global = true)]
    config: Option<String>,

    /// Enable verbose output (info level)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress all non-essential output (error level only)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Enable debug output (debug level)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub fn config_path(&self, settings: &Settings) -> Result<String> {
        self.config
            .clone()
            .or_else(|| settings.schema.clone())
            .ok_or_else(|| {
                ConfigError::InvalidSchema(
                    "no schema document: pass --config or set SCHEMA".to_string(),
                )
                .into()
            })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install (or remove) triggers, the notification function, the
    /// replication slot, and helper views
    Bootstrap(BootstrapArgs),

    /// Run the sync engine once, or forever with --daemon
    Sync {
        /// Keep running: listen for notifications and poll the slot
        #[arg(long)]
        daemon: bool,
    },

    /// Full backfill with tuple-id paging across parallel workers
    ParallelSync {
        /// Number of worker tasks
        #[arg(long, default_value = "4")]
        nprocs: usize,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();
    initialize_logging(&cli);

    if let Err(e) = run_main(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(error::exit_code(&e));
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn initialize_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn" // default level
    };

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_main(cli: Cli) -> Result<()> {
    let settings = Settings::from_env()?;

    match &cli.command {
        Commands::Bootstrap(args) => commands::cmd_bootstrap(&cli, args, settings).await,
        Commands::Sync { daemon } => commands::cmd_sync(&cli, *daemon, settings).await,
        Commands::ParallelSync { nprocs } => {
            commands::cmd_parallel_sync(&cli, *nprocs, settings).await
        }
    }
}
