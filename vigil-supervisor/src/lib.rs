//! Vigil Supervisor - launch, monitor and restart long-running agent workloads
//!
//! Agents are opaque command-line workloads described by an
//! [`AgentDescriptor`](vigil_core::agent::AgentDescriptor). The supervisor:
//!
//! - **Launches** every autonomous agent with its configured number of workers,
//!   either as OS processes or as in-process tasks
//! - **Monitors** worker liveness on a fixed tick and restarts failed agents,
//!   up to a cap of consecutive failed restarts
//! - **Schedules** maintenance, health reporting and data sync tasks that
//!   persist their output through the result sink
//! - **Shuts down** on SIGINT/SIGTERM with a bounded grace period per worker
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_core::config::VigilConfig;
//! use vigil_supervisor::Supervisor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VigilConfig::load()?;
//!     let supervisor = Supervisor::new(&config)?;
//!
//!     let report = supervisor.run_until_signal().await?;
//!     std::process::exit(if report.is_clean() { 0 } else { 1 });
//! }
//! ```

mod error;
mod lifecycle;
mod monitor;
mod process;
mod scheduler;
mod signal;
mod supervisor;
mod tasks;
mod worker;

pub use error::{Result, SupervisorError};
pub use lifecycle::Fleet;
pub use monitor::HealthMonitor;
pub use process::{AgentInstance, Launcher, LauncherConfig, ProcessLauncher, StopReport};
pub use scheduler::{ScheduledTask, Scheduler, TaskHandler};
pub use signal::shutdown_signal;
pub use supervisor::{ShutdownReport, StartReport, Supervisor};
pub use tasks::SupervisorTasks;
pub use worker::{ProcessWorker, StopOutcome, TaskWorker, WorkerHandle, WorkerId};
