//! Health monitor
//!
//! Runs on a fixed tick independent of any agent's own interval. Each tick
//! probes the agents that are due, records a [`HealthRecord`] for each, and
//! schedules restarts off the tick so one slow restart never delays the
//! evaluation of other agents. A restarted agent is re-probed on the next
//! tick.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vigil_core::agent::{HealthRecord, InstanceStatus};

use crate::lifecycle::{AgentSlot, Fleet};
use crate::process::{AgentInstance, Launcher};

/// What a tick decided for one agent
enum Action {
    Restart {
        agent_id: String,
        instance: Option<AgentInstance>,
        generation: u64,
    },
    Retire(AgentInstance),
}

/// Periodic liveness prober with capped restarts
#[derive(Clone)]
pub struct HealthMonitor {
    fleet: Fleet,
    launcher: Arc<dyn Launcher>,
    max_restart_failures: u32,
    restarts: TaskTracker,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(fleet: Fleet, launcher: Arc<dyn Launcher>, max_restart_failures: u32) -> Self {
        Self {
            fleet,
            launcher,
            max_restart_failures,
            restarts: TaskTracker::new(),
        }
    }

    /// Drive [`tick`](Self::tick) every `period` until cancelled
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!(?period, "Health monitor started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Health monitor stopped");
    }

    /// One evaluation pass over every due agent.
    ///
    /// Returns the records produced by this tick.
    pub async fn tick(&self) -> Vec<HealthRecord> {
        let now = Instant::now();
        let mut records = Vec::new();
        let mut actions = Vec::new();

        {
            let mut state = self.fleet.lock().await;
            if state.closed {
                return records;
            }
            for (agent_id, slot) in state.slots.iter_mut() {
                if !is_due(slot, now) {
                    continue;
                }
                if let Some(action) = self.evaluate(agent_id, slot, now) {
                    actions.push(action);
                }
                if let Some(record) = &slot.last_record {
                    records.push(record.clone());
                }
            }
        }

        for action in actions {
            match action {
                Action::Restart {
                    agent_id,
                    instance,
                    generation,
                } => self.spawn_restart(agent_id, instance, generation),
                Action::Retire(instance) => {
                    let launcher = self.launcher.clone();
                    self.restarts.spawn(async move {
                        if let Err(e) = launcher.stop(instance).await {
                            error!("Failed to stop agent after restart cap: {}", e);
                        }
                    });
                }
            }
        }

        records
    }

    /// Probe one slot and apply the status and restart rules
    fn evaluate(&self, agent_id: &str, slot: &mut AgentSlot, now: Instant) -> Option<Action> {
        let workers = slot.instance.as_mut().map(AgentInstance::probe).unwrap_or_default();
        slot.last_probe = Some(now);

        let alive = workers.iter().filter(|w| w.alive).count();
        if alive == slot.descriptor.workers {
            if slot.status != InstanceStatus::Running {
                info!(agent_id, "Agent healthy: {}/{} workers alive", alive, slot.descriptor.workers);
            }
            slot.restart_failures = 0;
            slot.record(InstanceStatus::Running, workers);
            return None;
        }

        warn!(agent_id, "Agent unhealthy: {}/{} workers alive", alive, slot.descriptor.workers);
        slot.record(InstanceStatus::Unhealthy, workers);

        if !slot.descriptor.restart_on_failure {
            return None;
        }

        if slot.restart_failures >= self.max_restart_failures {
            error!(
                agent_id,
                restart_failures = slot.restart_failures,
                "Restart cap reached, stopping agent until explicitly restarted"
            );
            return slot.take_for_stop().map(Action::Retire);
        }

        slot.restart_failures += 1;
        let attempt = slot.restart_failures;
        let (instance, generation) = slot.begin_restart()?;
        info!(agent_id, attempt, max = self.max_restart_failures, "Restarting agent");
        Some(Action::Restart {
            agent_id: agent_id.to_string(),
            instance,
            generation,
        })
    }

    fn spawn_restart(&self, agent_id: String, instance: Option<AgentInstance>, generation: u64) {
        let fleet = self.fleet.clone();
        let launcher = self.launcher.clone();

        self.restarts.spawn(async move {
            let result = match instance {
                Some(instance) => launcher.restart(instance).await.map_err(|e| e.to_string()),
                None => match fleet.descriptor(&agent_id).await {
                    Some(descriptor) => Ok(launcher.start(descriptor).await),
                    None => Err("descriptor disappeared".to_string()),
                },
            };
            if let Err(e) = &result {
                error!(agent_id = %agent_id, "Restart failed: {}", e);
            }

            let stale = {
                let mut state = fleet.lock().await;
                match state.slots.get_mut(&agent_id) {
                    Some(slot) => slot.finish_restart(generation, result),
                    None => result.ok(),
                }
            };

            if let Some(instance) = stale {
                debug!(agent_id = %agent_id, "Agent stopped during restart, discarding new instance");
                if let Err(e) = launcher.stop(instance).await {
                    error!(agent_id = %agent_id, "Failed to stop discarded instance: {}", e);
                }
            }
        });
    }

    /// Number of restarts (and cap stops) still running
    pub fn in_flight(&self) -> usize {
        self.restarts.len()
    }

    /// Wait for in-flight restarts to finish
    pub async fn settle(&self) {
        self.restarts.close();
        self.restarts.wait().await;
        self.restarts.reopen();
    }

    /// Wait for in-flight restarts at shutdown. `false` on timeout.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.restarts.close();
        timeout(limit, self.restarts.wait()).await.is_ok()
    }
}

/// Live-ish slots whose interval elapsed since their last probe
fn is_due(slot: &AgentSlot, now: Instant) -> bool {
    if slot.restart_in_flight {
        return false;
    }
    let probed_state = match slot.status {
        InstanceStatus::Running | InstanceStatus::Degraded => slot.instance.is_some(),
        InstanceStatus::Unhealthy => true,
        _ => false,
    };
    probed_state
        && slot
            .last_probe
            .is_none_or(|last| now.duration_since(last) >= slot.descriptor.health_check_interval)
}
