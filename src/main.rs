//! Darvazeh - Privilege-Separated VPN Gateway
//!
//! The supervisor binary: binds the listening surface, starts the
//! security module, and runs the accept/dispatch event loop until told to
//! stop.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use darvazeh::{GatewayConfig, Supervisor};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");
const BUILD_TARGET: &str = env!("BUILD_TARGET");

#[derive(Parser)]
#[command(name = "darvazeh")]
#[command(author = "Sina Rabbani")]
#[command(version = VERSION)]
#[command(about = "Privilege-Separated VPN Gateway", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway supervisor
    Run {
        /// Stay in the foreground (the supervisor never daemonizes
        /// itself; this suppresses the reminder that an init system
        /// should supervise it)
        #[arg(long)]
        foreground: bool,

        /// Skip the PID file
        #[arg(long)]
        no_pid_file: bool,
    },

    /// Generate a commented configuration file
    Genconf {
        /// Where to write the configuration
        #[arg(short, long, default_value = "darvazeh.toml")]
        output: PathBuf,
    },

    /// Show version and build information
    Version {
        /// Output format: text (default) or json
        #[arg(long, default_value = "text")]
        format: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logger with multiple verbosity levels
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();

    if cli.verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if cli.verbose >= 3 {
        logger.filter_module("darvazeh", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }

    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    let result = match cli.command {
        Commands::Run {
            foreground,
            no_pid_file,
        } => run_gateway(cli.config, foreground, no_pid_file).await,
        Commands::Genconf { output } => generate_config(&output),
        Commands::Version { format } => show_version(&format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            // every fatal startup error exits with 1
            ExitCode::FAILURE
        }
    }
}

async fn run_gateway(
    config_path: Option<PathBuf>,
    foreground: bool,
    no_pid_file: bool,
) -> Result<()> {
    let config = match &config_path {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("could not load {}", path.display()))?,
        None => {
            warn!("no configuration file given, using defaults");
            GatewayConfig::default()
        }
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    // SAFETY: plain uid query.
    if unsafe { libc::geteuid() } != 0 {
        warn!("not running as root; privilege separation will be incomplete");
    }

    if !foreground {
        info!("darvazeh does not daemonize; run it under an init system or pass --foreground");
    }

    let pid_file = (!no_pid_file).then(|| config.process.pid_file.clone());
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("could not write PID file {}", path.display()))?;
    }

    info!("starting darvazeh {} on pid {}", VERSION, std::process::id());

    let run_result = async {
        let mut supervisor = Supervisor::new(config, config_path).await?;
        supervisor.run().await
    }
    .await;

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }

    run_result.context("gateway terminated abnormally")?;
    info!("clean shutdown");
    Ok(())
}

fn show_version(format: &str) -> Result<()> {
    match format {
        "json" => {
            let info = serde_json::json!({
                "version": VERSION,
                "git_hash": GIT_HASH,
                "build_date": BUILD_DATE,
                "target": BUILD_TARGET,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        _ => {
            println!(
                "darvazeh {} ({}, {}, built {})",
                VERSION, GIT_HASH, BUILD_TARGET, BUILD_DATE
            );
        }
    }
    Ok(())
}

fn generate_config(output: &PathBuf) -> Result<()> {
    let config = GatewayConfig::default();
    config
        .to_file(output)
        .with_context(|| format!("could not write {}", output.display()))?;

    println!("configuration written to {}", output.display());
    println!("quick start:");
    println!("  darvazeh -c {} run", output.display());
    Ok(())
}
