//! Sleeper Fleet Example
//!
//! Supervises three small shell agents until Ctrl-C:
//! - `sleepers`: two long-lived background workers
//! - `flaky`: a worker that dies every few seconds and gets restarted until
//!   the restart cap stops it
//! - `chatty`: an in-process worker whose output shows up in the debug log
//!
//! Run with `RUST_LOG=vigil_supervisor=debug cargo run --example sleeper_fleet`.

use std::time::Duration;
use vigil_core::agent::AgentKind;
use vigil_core::config::{ResultsConfig, ScheduleConfig, SupervisorSettings, VigilConfig};
use vigil_core::registry::DescriptorSpec;
use vigil_supervisor::Supervisor;

fn shell(id: &str, kind: AgentKind, script: &str, workers: usize) -> DescriptorSpec {
    DescriptorSpec {
        id: id.to_string(),
        kind: Some(kind),
        working_dir: std::env::temp_dir(),
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        workers: Some(workers),
        health_check_interval: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let results = tempfile::TempDir::new()?;
    let mut chatty = shell(
        "chatty",
        AgentKind::Communication,
        "while true; do echo heartbeat; sleep 1; done",
        1,
    );
    chatty.background = Some(false);

    let config = VigilConfig {
        supervisor: SupervisorSettings {
            health_tick: Duration::from_secs(1),
            scheduler_tick: Duration::from_secs(1),
            max_restart_failures: 3,
            ..Default::default()
        },
        results: ResultsConfig::in_dir(results.path()),
        schedule: ScheduleConfig {
            maintenance: Duration::from_secs(20),
            health_report: Duration::from_secs(5),
            data_sync: Duration::from_secs(10),
        },
        agents: vec![
            shell("sleepers", AgentKind::Crawler, "sleep 3600", 2),
            shell("flaky", AgentKind::Maintenance, "sleep 3; exit 1", 1),
            chatty,
        ],
        ..Default::default()
    };

    println!("Supervising 3 agents, results in {}", results.path().display());
    println!("Press Ctrl-C to stop\n");

    let supervisor = Supervisor::new(&config)?;
    let report = supervisor.run_until_signal().await?;

    println!("\nShutdown report:");
    println!("  stopped agents: {}", report.stopped.join(", "));
    println!("  graceful workers: {}", report.graceful);
    println!("  forced workers: {}", report.forced);
    println!("  artifacts: {}", supervisor.sink().entries().await?.len());

    Ok(())
}
