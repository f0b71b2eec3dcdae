//! Vigil CLI - run the supervisor and inspect its inputs and outputs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use vigil_core::config::VigilConfig;
use vigil_core::registry::AgentRegistry;
use vigil_core::results::ResultSink;
use vigil_supervisor::{Supervisor, SupervisorError};

/// Startup failed before the run loop
const EXIT_STARTUP_FATAL: u8 = 2;
/// Shutdown had to force-kill workers or timed out
const EXIT_UNCLEAN_SHUTDOWN: u8 = 1;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Agent process supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: vigil.toml, then VIGIL_CONFIG_PATH)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, env = "VIGIL_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise every autonomous agent until SIGINT/SIGTERM
    Run,
    /// List the agents discovery resolves
    Discover {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Result manifest commands
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Print the manifest entries
    Show {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Index artifacts that are missing from the manifest
    Reconcile,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_STARTUP_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Version => {
            println!("vigil {}", env!("CARGO_PKG_VERSION"));
            println!("vigil-core {}", vigil_core::VERSION);
        }
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            return supervise(&config).await;
        }
        Commands::Discover { json } => {
            let config = load_config(cli.config.as_deref())?;
            let report = AgentRegistry::from_config(&config).discover_detailed();
            for skipped in &report.skipped {
                warn!("Skipped: {}", skipped);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report.descriptors)?);
            } else {
                println!("{} agents ({} sources skipped)", report.descriptors.len(), report.skipped.len());
                for (id, d) in &report.descriptors {
                    println!(
                        "  {:<28} {:<18} workers={} autonomous={} background={} every {:?}  {}",
                        id,
                        d.kind.as_str(),
                        d.workers,
                        d.autonomous,
                        d.background,
                        d.health_check_interval,
                        d.command.join(" ")
                    );
                }
            }
        }
        Commands::Manifest { command } => {
            let config = load_config(cli.config.as_deref())?;
            let sink = ResultSink::new(&config.results).context("cannot open results directory")?;
            match command {
                ManifestCommands::Show { json } => {
                    let entries = sink.entries().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else {
                        println!("{} ({} entries)", sink.manifest_path().display(), entries.len());
                        for entry in entries {
                            println!(
                                "  {}  {:<32} {:>8}  {}",
                                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                                entry.source,
                                entry.size,
                                entry.compiled.display()
                            );
                        }
                    }
                }
                ManifestCommands::Reconcile => {
                    let added = sink.reconcile().await?;
                    println!("{} entries added to {}", added, sink.manifest_path().display());
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&Path>) -> Result<VigilConfig> {
    let config = match path {
        Some(path) => VigilConfig::from_file(path),
        None => VigilConfig::load(),
    };
    config.context("cannot read configuration")
}

async fn supervise(config: &VigilConfig) -> Result<ExitCode> {
    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e @ SupervisorError::StartupFatal(_)) => {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_STARTUP_FATAL));
        }
        Err(e) => return Err(e.into()),
    };

    let report = supervisor.run_until_signal().await?;
    if report.is_clean() {
        info!(stopped = report.stopped.len(), "Clean shutdown");
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(
            forced = report.forced,
            errors = report.errors.len(),
            loops_timed_out = report.loops_timed_out,
            "Unclean shutdown"
        );
        Ok(ExitCode::from(EXIT_UNCLEAN_SHUTDOWN))
    }
}
