//! Exchange coordinator - main entry point
//!
//! This binary provides three subcommands:
//! - paper: Replay order intents against the paper exchange
//! - nonce: Inspect or resync the persisted nonce record
//! - check-config: Validate a configuration file and print the effective values

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "exchange-coordinator")]
#[command(about = "Nonce, admission, balance and execution coordination for exchange clients", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit console logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay order intents through a paper connection
    Paper {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,

        /// Session file with starting balances, prices and intents
        #[arg(short, long, default_value = "configs/paper_intents.json")]
        intents: String,

        /// Nonce database path (overrides config file)
        #[arg(long)]
        state_db: Option<String>,
    },

    /// Inspect or repair the persisted nonce record
    Nonce {
        #[command(subcommand)]
        action: NonceAction,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,
    },
}

#[derive(Subcommand, Debug)]
enum NonceAction {
    /// Print every stored nonce record
    Show {
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,
    },

    /// Move the stored nonce ahead of the clock
    Resync {
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,

        /// Margin in seconds (defaults to nonce.resync_margin_us)
        #[arg(long)]
        margin_secs: Option<u64>,
    },
}

fn setup_logging(verbose: bool, json: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // Log file naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{},rusqlite=warn", level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep stdout clean for machine-readable output
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
        return Ok(());
    }

    let console_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true)
            .boxed()
    };

    // File layer - same format but without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Paper { .. } => ("paper", false),
        Commands::Nonce { .. } => ("nonce", true),
        Commands::CheckConfig { .. } => ("check_config", true),
    };

    setup_logging(cli.verbose, cli.json_logs, command_name, file_only)?;

    match cli.command {
        Commands::Paper {
            config,
            intents,
            state_db,
        } => commands::paper::run(config, intents, state_db),

        Commands::Nonce { action } => match action {
            NonceAction::Show { config } => commands::nonce::show(config),
            NonceAction::Resync {
                config,
                margin_secs,
            } => commands::nonce::resync(config, margin_secs),
        },

        Commands::CheckConfig { config } => commands::check_config::run(config),
    }
}
