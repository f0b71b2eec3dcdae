//! Supervisor: discovery, launch, monitoring, scheduling and shutdown

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vigil_core::agent::{AgentDescriptor, HealthRecord, InstanceStatus};
use vigil_core::config::{SupervisorSettings, VigilConfig};
use vigil_core::registry::AgentRegistry;
use vigil_core::results::ResultSink;

use crate::lifecycle::Fleet;
use crate::monitor::HealthMonitor;
use crate::process::{AgentInstance, Launcher, LauncherConfig, ProcessLauncher, StopReport};
use crate::scheduler::Scheduler;
use crate::signal::shutdown_signal;
use crate::tasks::SupervisorTasks;
use crate::{Result, SupervisorError};

/// What `start_all` did
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    /// Descriptors discovered
    pub discovered: usize,
    /// Descriptor sources skipped with a warning
    pub skipped: usize,
    /// Status of every autonomous agent that was launched
    pub started: BTreeMap<String, InstanceStatus>,
}

/// What `stop_all` did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Agents whose instance was stopped
    pub stopped: Vec<String>,
    /// Workers that exited within the grace period
    pub graceful: usize,
    /// Workers that had to be killed
    pub forced: usize,
    /// Workers that could not be killed
    pub errors: Vec<String>,
    /// A loop or in-flight restart outlived the shutdown timeout
    pub loops_timed_out: bool,
}

impl ShutdownReport {
    /// Everything exited on its own within its budget
    pub fn is_clean(&self) -> bool {
        self.forced == 0 && self.errors.is_empty() && !self.loops_timed_out
    }
}

/// Agent process supervisor
pub struct Supervisor {
    settings: SupervisorSettings,
    registry: AgentRegistry,
    launcher: Arc<dyn Launcher>,
    sink: Arc<ResultSink>,
    fleet: Fleet,
    monitor: HealthMonitor,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    loops: TaskTracker,
    started: AtomicBool,
    shutdown: OnceCell<ShutdownReport>,
}

impl Supervisor {
    /// Create a supervisor backed by [`ProcessLauncher`].
    ///
    /// # Errors
    ///
    /// [`SupervisorError::StartupFatal`] when the configuration is invalid or
    /// the results directory cannot be created.
    pub fn new(config: &VigilConfig) -> Result<Self> {
        let launcher = ProcessLauncher::new(LauncherConfig::from(&config.supervisor));
        Self::with_launcher(config, Arc::new(launcher))
    }

    /// Create a supervisor with a custom launcher
    pub fn with_launcher(config: &VigilConfig, launcher: Arc<dyn Launcher>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SupervisorError::StartupFatal(e.to_string()))?;
        let sink = ResultSink::new(&config.results)
            .map_err(|e| SupervisorError::StartupFatal(e.to_string()))?;
        let sink = Arc::new(sink);

        let settings = config.supervisor.clone();
        let fleet = Fleet::default();
        let monitor = HealthMonitor::new(fleet.clone(), launcher.clone(), settings.max_restart_failures);
        let tasks = SupervisorTasks::new(fleet.clone(), sink.clone());
        let scheduler = Scheduler::new(
            &config.schedule,
            Arc::new(tasks),
            settings.handler_concurrency,
            Utc::now(),
        );

        Ok(Self {
            settings,
            registry: AgentRegistry::from_config(config),
            launcher,
            sink,
            fleet,
            monitor,
            scheduler: Arc::new(scheduler),
            cancel: CancellationToken::new(),
            loops: TaskTracker::new(),
            started: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        })
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &Arc<ResultSink> {
        &self.sink
    }

    /// Discover agents, launch the autonomous ones, then start the health
    /// monitor and scheduler loops
    pub async fn start_all(&self) -> Result<StartReport> {
        if self.fleet.lock().await.closed {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Supervisor already started");
            return Ok(StartReport::default());
        }

        let mut report = self.discover().await;
        let autonomous: Vec<String> = self
            .fleet
            .lock()
            .await
            .slots
            .values()
            .filter(|slot| slot.descriptor.autonomous)
            .map(|slot| slot.descriptor.id.clone())
            .collect();
        for agent_id in autonomous {
            match self.start_agent(&agent_id).await {
                Ok(status) => {
                    report.started.insert(agent_id, status);
                }
                Err(e) => error!(agent_id = %agent_id, "Failed to start agent: {}", e),
            }
        }

        let monitor = self.monitor.clone();
        let health_tick = self.settings.health_tick;
        let token = self.cancel.child_token();
        self.loops.spawn(async move { monitor.run(health_tick, token).await });

        let scheduler = self.scheduler.clone();
        let scheduler_tick = self.settings.scheduler_tick;
        let token = self.cancel.child_token();
        self.loops.spawn(async move { scheduler.run(scheduler_tick, token).await });

        info!(
            discovered = report.discovered,
            skipped = report.skipped,
            started = report.started.len(),
            "Supervisor started"
        );
        Ok(report)
    }

    /// Run discovery and open a slot for every descriptor found, without
    /// starting anything
    pub async fn discover(&self) -> StartReport {
        let discovery = self.registry.discover_detailed();
        self.fleet
            .lock()
            .await
            .register(discovery.descriptors.values().cloned());

        StartReport {
            discovered: discovery.descriptors.len(),
            skipped: discovery.skipped.len(),
            ..Default::default()
        }
    }

    /// Start one agent. A no-op returning the current status when it is
    /// already up. Re-arms an agent stopped by the restart cap and replaces
    /// an Unhealthy or Degraded instance.
    pub async fn start_agent(&self, agent_id: &str) -> Result<InstanceStatus> {
        let (previous, descriptor, generation) = {
            let mut state = self.fleet.lock().await;
            if state.closed {
                return Err(SupervisorError::ShuttingDown);
            }
            let slot = state
                .slots
                .get_mut(agent_id)
                .ok_or_else(|| SupervisorError::AgentNotFound(agent_id.to_string()))?;
            match slot.begin_start() {
                Some((previous, generation)) => (previous, slot.descriptor.clone(), generation),
                None => {
                    debug!(agent_id, status = %slot.status, "Agent already running");
                    return Ok(slot.status);
                }
            }
        };

        if let Some(previous) = previous {
            info!(agent_id, workers = previous.worker_count(), "Replacing failed agent instance");
            if let Err(e) = self.launcher.stop(previous).await {
                warn!(agent_id, "Failed to stop previous instance: {}", e);
            }
        }

        let instance = self.launcher.start(descriptor).await;
        let status = instance.status();
        self.install(agent_id, generation, Ok(instance), false).await?;
        Ok(status)
    }

    /// Stop one agent, from any state
    pub async fn stop_agent(&self, agent_id: &str) -> Result<StopReport> {
        let instance = {
            let mut state = self.fleet.lock().await;
            let slot = state
                .slots
                .get_mut(agent_id)
                .ok_or_else(|| SupervisorError::AgentNotFound(agent_id.to_string()))?;
            slot.take_for_stop()
        };

        match instance {
            Some(instance) => self.launcher.stop(instance).await,
            None => Ok(StopReport {
                agent_id: agent_id.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Restart one agent with fresh workers and reset its restart counter
    pub async fn restart_agent(&self, agent_id: &str) -> Result<InstanceStatus> {
        let (previous, generation, descriptor) = {
            let mut state = self.fleet.lock().await;
            if state.closed {
                return Err(SupervisorError::ShuttingDown);
            }
            let slot = state
                .slots
                .get_mut(agent_id)
                .ok_or_else(|| SupervisorError::AgentNotFound(agent_id.to_string()))?;
            slot.restart_failures = 0;
            match slot.begin_restart() {
                Some((previous, generation)) => (previous, generation, slot.descriptor.clone()),
                None => return Ok(slot.status),
            }
        };

        info!(agent_id, "Restarting agent on request");
        let result = match previous {
            Some(instance) => self.launcher.restart(instance).await,
            None => Ok(self.launcher.start(descriptor).await),
        };
        let status = result.as_ref().map(AgentInstance::status).ok();
        let (result, failure) = match result {
            Ok(instance) => (Ok(instance), None),
            Err(e) => (Err(e.to_string()), Some(e)),
        };

        self.install(agent_id, generation, result, true).await?;
        match (status, failure) {
            (_, Some(e)) => Err(e),
            (Some(status), None) => Ok(status),
            (None, None) => Ok(InstanceStatus::Unhealthy),
        }
    }

    /// Hand a launch result to the fleet; stop it when the slot moved on
    async fn install(
        &self,
        agent_id: &str,
        generation: u64,
        result: std::result::Result<AgentInstance, String>,
        restart: bool,
    ) -> Result<()> {
        let stale = {
            let mut state = self.fleet.lock().await;
            match state.slots.get_mut(agent_id) {
                Some(slot) if restart => slot.finish_restart(generation, result),
                Some(slot) => match result {
                    Ok(instance) => slot.finish_start(generation, instance),
                    Err(_) => None,
                },
                None => result.ok(),
            }
        };

        if let Some(instance) = stale {
            debug!(agent_id, "Agent stopped during launch, discarding new instance");
            self.launcher.stop(instance).await?;
        }
        Ok(())
    }

    /// Latest health record of an agent
    pub async fn health(&self, agent_id: &str) -> Option<HealthRecord> {
        self.fleet.health(agent_id).await
    }

    /// Latest health record of every agent
    pub async fn health_snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.fleet.snapshot().await
    }

    /// Agents with a live instance or a launch in progress
    pub async fn active_agents(&self) -> Vec<String> {
        self.fleet.active_agents().await
    }

    /// Descriptors currently known to the fleet
    pub async fn descriptors(&self) -> BTreeMap<String, Arc<AgentDescriptor>> {
        self.fleet
            .lock()
            .await
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.descriptor.clone()))
            .collect()
    }

    /// Stop loops and every agent. Runs the teardown once; later and
    /// concurrent callers get the same report.
    pub async fn stop_all(&self) -> ShutdownReport {
        self.shutdown.get_or_init(|| self.teardown()).await.clone()
    }

    async fn teardown(&self) -> ShutdownReport {
        info!("Stopping supervisor");
        let instances: Vec<AgentInstance> = {
            let mut state = self.fleet.lock().await;
            state.closed = true;
            state
                .slots
                .values_mut()
                .filter(|slot| slot.is_busy())
                .filter_map(|slot| slot.take_for_stop())
                .collect()
        };
        self.cancel.cancel();

        let mut report = ShutdownReport::default();
        let stops = join_all(instances.into_iter().map(|instance| {
            let agent_id = instance.agent_id().to_string();
            let launcher = self.launcher.clone();
            async move { (agent_id, launcher.stop(instance).await) }
        }))
        .await;
        for (agent_id, result) in stops {
            match result {
                Ok(stop) => {
                    report.graceful += stop.graceful;
                    report.forced += stop.forced;
                }
                Err(e) => report.errors.push(e.to_string()),
            }
            report.stopped.push(agent_id);
        }

        let limit = self.settings.loop_shutdown_timeout;
        self.loops.close();
        let loops_done = timeout(limit, self.loops.wait()).await.is_ok();
        let restarts_done = self.monitor.shutdown(limit).await;
        let handlers_done = self.scheduler.shutdown(limit).await;
        report.loops_timed_out = !(loops_done && restarts_done && handlers_done);
        if report.loops_timed_out {
            warn!(
                loops_done,
                restarts_done, handlers_done, "Shutdown timeout exceeded waiting for background work"
            );
        }

        match self.sink.flush_pending().await {
            Ok(0) => {}
            Ok(flushed) => info!(flushed, "Flushed pending manifest entries"),
            Err(e) => warn!("Pending manifest entries not flushed: {}", e),
        }

        info!(
            stopped = report.stopped.len(),
            forced = report.forced,
            errors = report.errors.len(),
            "Supervisor stopped"
        );
        report
    }

    /// Start everything, wait for SIGINT/SIGTERM, then stop everything.
    ///
    /// Further signals during shutdown are logged and ignored.
    pub async fn run_until_signal(&self) -> Result<ShutdownReport> {
        self.start_all().await?;

        let name = shutdown_signal().await.map_err(|e| SupervisorError::Other(e.into()))?;
        info!(signal = name, "Shutting down");

        let stop = self.stop_all();
        tokio::pin!(stop);
        let mut listening = true;
        loop {
            tokio::select! {
                report = &mut stop => return Ok(report),
                result = shutdown_signal(), if listening => match result {
                    Ok(name) => warn!(signal = name, "Shutdown already in progress, ignoring signal"),
                    Err(e) => {
                        warn!("Cannot listen for further signals: {}", e);
                        listening = false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vigil_core::config::ResultsConfig;

    fn config(dir: &TempDir) -> VigilConfig {
        VigilConfig {
            results: ResultsConfig::in_dir(dir.path().join("results")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unwritable_results_dir_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("results");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = Supervisor::new(&config(&dir)).err().unwrap();
        assert!(matches!(err, SupervisorError::StartupFatal(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.supervisor.handler_concurrency = 0;
        assert!(matches!(Supervisor::new(&config), Err(SupervisorError::StartupFatal(_))));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(&config(&dir)).unwrap();
        assert!(matches!(
            supervisor.start_agent("ghost").await,
            Err(SupervisorError::AgentNotFound(_))
        ));
        assert!(matches!(
            supervisor.stop_agent("ghost").await,
            Err(SupervisorError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_fleet_lifecycle() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(&config(&dir)).unwrap();

        let started = supervisor.start_all().await.unwrap();
        assert_eq!(started.discovered, 0);

        let report = supervisor.stop_all().await;
        assert!(report.is_clean());
        assert!(matches!(supervisor.start_all().await, Err(SupervisorError::ShuttingDown)));
    }
}
