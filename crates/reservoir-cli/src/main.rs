//! reservoir: command-line front end for the connection pool engine.
//!
//! # Usage
//!
//! ```text
//! reservoir config check pool.toml
//! reservoir soak --config pool.toml --workers 16 --duration-secs 30 --failure-rate 0.01
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod sim;

#[derive(Parser)]
#[command(
    name = "reservoir",
    about = "Reservoir: bounded, validating connection pool",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect pool configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run concurrent borrowers against a simulated backend and print the
    /// final pool statistics as JSON.
    Soak {
        /// Pool configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Concurrent borrowers
        #[arg(short, long, default_value = "8")]
        workers: usize,
        /// How long to run
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,
        /// Probability that a simulated probe fails (0.0 to 1.0)
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,
        /// How long each borrower holds its connection
        #[arg(long, default_value = "5")]
        hold_ms: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load, normalize and print a configuration as JSON
    Check {
        /// Path to the TOML file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reservoir=info".parse()?)
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Check { file } => commands::config::check(&file),
        },
        Commands::Soak {
            config,
            workers,
            duration_secs,
            failure_rate,
            hold_ms,
        } => {
            let opts = commands::soak::SoakOptions {
                workers,
                duration: std::time::Duration::from_secs(duration_secs),
                failure_rate,
                hold: std::time::Duration::from_millis(hold_ms),
            };
            commands::soak::soak(&config, opts).await
        }
    }
}
