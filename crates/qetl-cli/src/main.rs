//! QETL CLI tool.

use anyhow::Context;
use clap::{Parser, Subcommand};
use qetl_config::SystemConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "qetl")]
#[command(about = "Run and track QETL pipeline jobs", long_about = None)]
struct Cli {
    /// System configuration file (defaults to ./qetl.kdl when present)
    #[arg(long, global = true, env = "QETL_CONFIG")]
    config: Option<PathBuf>,

    /// QETL installation directory
    #[arg(long, global = true, env = "QETL_HOME")]
    qetl_home: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit pipelines and wait for them to finish
    Submit {
        /// Pipeline documents (.kdl or .json)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Execution timeout in seconds, overriding the pipeline's own
        #[arg(long)]
        timeout: Option<u64>,
        /// Print results of completed jobs
        #[arg(long)]
        show_results: bool,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
        /// Save results to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a pipeline document
    Validate {
        /// Path to the pipeline document
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available processing components
    Components {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show information about the local instance
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = SystemConfig::load(cli.config.as_deref())
        .context("Failed to load system configuration")?;
    if let Some(home) = cli.qetl_home {
        config.executor.home = Some(home);
    }

    match cli.command {
        Commands::Submit {
            files,
            timeout,
            show_results,
            json,
            output,
        } => {
            let manager = commands::manager(&config)?;
            let options = commands::jobs::SubmitOptions {
                timeout,
                show_results,
                json,
                output,
                list_limit: config.list_limit,
            };
            commands::jobs::submit(&manager, &files, &options).await?;
        }
        Commands::Validate { path, json } => {
            let manager = commands::manager(&config)?;
            commands::validate(&manager, &path, json)?;
        }
        Commands::Components { json } => {
            let manager = commands::manager(&config)?;
            commands::info::components(&manager, json)?;
        }
        Commands::Info { json } => {
            let manager = commands::manager(&config)?;
            commands::info::info(&manager, json)?;
        }
    }

    Ok(())
}
