//! Process launcher: start, stop and restart the workers backing one agent

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vigil_core::agent::{AgentDescriptor, InstanceStatus, WorkerLiveness};
use vigil_core::config::SupervisorSettings;

use crate::worker::{StopOutcome, WorkerHandle, WorkerId};
use crate::{Result, SupervisorError};

/// Configuration for the process launcher
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Time a worker gets to exit after the termination request
    pub grace_period: Duration,

    /// Time allowed for a killed worker to be reaped
    pub kill_timeout: Duration,

    /// Where background workers write stdout/stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
            log_dir: None,
        }
    }
}

impl From<&SupervisorSettings> for LauncherConfig {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            grace_period: settings.stop_grace_period,
            log_dir: settings.worker_log_dir.clone(),
            ..Default::default()
        }
    }
}

/// Runtime record of a launched agent
#[derive(Debug)]
pub struct AgentInstance {
    descriptor: Arc<AgentDescriptor>,
    workers: Vec<WorkerHandle>,
    started_at: DateTime<Utc>,
    status: InstanceStatus,
    launch_errors: Vec<String>,
}

impl AgentInstance {
    /// Agent ID
    pub fn agent_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Descriptor the instance was launched from
    pub fn descriptor(&self) -> &Arc<AgentDescriptor> {
        &self.descriptor
    }

    /// Status at launch: Running, or Degraded when some workers failed to spawn
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of workers that were spawned
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(WorkerHandle::id).collect()
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(WorkerHandle::pid).collect()
    }

    /// Spawn failures recorded at launch
    pub fn launch_errors(&self) -> &[String] {
        &self.launch_errors
    }

    /// Probe every spawned worker without blocking
    pub fn probe(&mut self) -> Vec<WorkerLiveness> {
        self.workers.iter_mut().map(WorkerHandle::probe).collect()
    }
}

/// Outcome of stopping one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub agent_id: String,
    /// Workers that exited within the grace period
    pub graceful: usize,
    /// Workers that had to be killed
    pub forced: usize,
    /// Workers that were already gone
    pub already_exited: usize,
}

/// Starts and stops the workers of an agent
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn `descriptor.workers` workers.
    ///
    /// Never fails: when some workers cannot be spawned the instance is
    /// returned as Degraded with whatever did launch.
    async fn start(&self, descriptor: Arc<AgentDescriptor>) -> AgentInstance;

    /// Terminate every worker of the instance, force-killing stragglers
    async fn stop(&self, instance: AgentInstance) -> Result<StopReport>;

    /// Stop, then start from the same descriptor with fresh workers
    async fn restart(&self, instance: AgentInstance) -> Result<AgentInstance> {
        let descriptor = instance.descriptor().clone();
        self.stop(instance).await.map_err(|e| SupervisorError::Restart {
            agent_id: descriptor.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(self.start(descriptor).await)
    }
}

/// Launcher backed by OS processes and tokio tasks
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: LauncherConfig,
}

impl ProcessLauncher {
    /// Create a new process launcher
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&self, descriptor: Arc<AgentDescriptor>) -> AgentInstance {
        info!(
            agent_id = %descriptor.id,
            kind = %descriptor.kind,
            workers = descriptor.workers,
            "Starting agent"
        );

        let mut workers = Vec::with_capacity(descriptor.workers);
        let mut launch_errors = Vec::new();
        for index in 0..descriptor.workers {
            match WorkerHandle::spawn(&descriptor, index, self.config.log_dir.as_deref()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!(agent_id = %descriptor.id, "{}", e);
                    launch_errors.push(e.to_string());
                }
            }
        }

        let status = if workers.len() == descriptor.workers {
            InstanceStatus::Running
        } else {
            warn!(
                agent_id = %descriptor.id,
                "Agent degraded: {}/{} workers launched",
                workers.len(),
                descriptor.workers
            );
            InstanceStatus::Degraded
        };

        AgentInstance {
            descriptor,
            workers,
            started_at: Utc::now(),
            status,
            launch_errors,
        }
    }

    async fn stop(&self, instance: AgentInstance) -> Result<StopReport> {
        let AgentInstance { descriptor, workers, .. } = instance;
        info!(agent_id = %descriptor.id, workers = workers.len(), "Stopping agent");

        let grace = self.config.grace_period;
        let kill_timeout = self.config.kill_timeout;
        let outcomes = join_all(workers.into_iter().map(|mut worker| async move {
            let outcome = worker.terminate(grace, kill_timeout).await;
            (worker.id(), outcome)
        }))
        .await;

        let mut report = StopReport {
            agent_id: descriptor.id.clone(),
            ..Default::default()
        };
        let mut first_error = None;
        for (worker_id, outcome) in outcomes {
            match outcome {
                Ok(StopOutcome::Graceful) => report.graceful += 1,
                Ok(StopOutcome::AlreadyExited) => report.already_exited += 1,
                Ok(StopOutcome::Forced) => {
                    warn!(agent_id = %descriptor.id, worker = %worker_id, "Worker force-killed");
                    report.forced += 1;
                }
                Err(e) => {
                    error!(agent_id = %descriptor.id, "{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(agent_id = %descriptor.id, ?report, "Agent stopped");
                Ok(report)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vigil_core::agent::AgentKind;

    fn descriptor(script: &str, workers: usize) -> Arc<AgentDescriptor> {
        Arc::new(AgentDescriptor {
            id: "launcher-test".to_string(),
            kind: AgentKind::Crawler,
            working_dir: std::env::temp_dir(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            workers,
            autonomous: true,
            background: true,
            health_check_interval: Duration::ZERO,
            restart_on_failure: true,
            schedule: None,
            metadata: BTreeMap::new(),
        })
    }

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(LauncherConfig {
            grace_period: Duration::from_secs(2),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_start_spawns_every_worker() {
        let launcher = launcher();
        let mut instance = launcher.start(descriptor("sleep 30", 3)).await;

        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.worker_count(), 3);
        assert!(instance.probe().iter().all(|w| w.alive));

        let report = launcher.stop(instance).await.unwrap();
        assert_eq!(report.graceful, 3);
        assert_eq!(report.forced, 0);
    }

    #[tokio::test]
    async fn test_unspawnable_command_is_degraded() {
        let launcher = launcher();
        let mut d = (*descriptor("true", 2)).clone();
        d.command = vec!["/nonexistent/agent-binary".to_string()];

        let instance = launcher.start(Arc::new(d)).await;
        assert_eq!(instance.status(), InstanceStatus::Degraded);
        assert_eq!(instance.worker_count(), 0);
        assert_eq!(instance.launch_errors().len(), 2);

        let report = launcher.stop(instance).await.unwrap();
        assert_eq!(report, StopReport { agent_id: "launcher-test".to_string(), ..Default::default() });
    }

    #[tokio::test]
    async fn test_restart_replaces_every_worker() {
        let launcher = launcher();
        let instance = launcher.start(descriptor("sleep 30", 2)).await;
        let before = instance.worker_ids();
        let old_pids = instance.worker_pids();

        let restarted = launcher.restart(instance).await.unwrap();
        let after = restarted.worker_ids();

        assert_eq!(restarted.status(), InstanceStatus::Running);
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|id| !before.contains(id)));
        assert!(restarted.worker_pids().iter().all(|pid| !old_pids.contains(pid)));

        launcher.stop(restarted).await.unwrap();
    }
}
