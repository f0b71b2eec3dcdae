//! Fleet state: one slot per known agent, guarded by a single lock
//!
//! Every mutation of the active-instance set goes through [`Fleet`]. The
//! supervisor (start/stop paths) and the health monitor (restart path) hold
//! clones of the same fleet, so their updates are serialized.
//!
//! Per-slot state machine:
//!
//! ```text
//! Stopped -> Starting -> {Running | Degraded} -> Unhealthy -> Restarting -> {Running | Stopped}
//! ```
//!
//! An explicit stop moves any state straight to Stopped. Every transition
//! bumps or checks the slot's generation so a launch that finishes after the
//! slot moved on is detected and its instance handed back for stopping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use vigil_core::agent::{AgentDescriptor, HealthRecord, InstanceStatus, WorkerLiveness};

use crate::process::AgentInstance;
use crate::worker::WorkerId;

/// Runtime state of one agent
#[derive(Debug)]
pub(crate) struct AgentSlot {
    pub descriptor: Arc<AgentDescriptor>,
    pub instance: Option<AgentInstance>,
    pub status: InstanceStatus,
    pub last_record: Option<HealthRecord>,
    pub last_probe: Option<Instant>,
    pub restart_failures: u32,
    pub restart_in_flight: bool,
    pub generation: u64,
}

impl AgentSlot {
    fn new(descriptor: Arc<AgentDescriptor>) -> Self {
        Self {
            descriptor,
            instance: None,
            status: InstanceStatus::Stopped,
            last_record: None,
            last_probe: None,
            restart_failures: 0,
            restart_in_flight: false,
            generation: 0,
        }
    }

    /// Replace the latest health record, keeping timestamps monotonic
    pub fn record(&mut self, status: InstanceStatus, workers: Vec<WorkerLiveness>) {
        let record = HealthRecord::new(
            self.descriptor.id.clone(),
            status,
            self.descriptor.workers,
            workers,
            self.restart_failures,
        )
        .not_before(self.last_record.as_ref());
        self.status = status;
        self.last_record = Some(record);
    }

    /// Has a live instance or a launch in progress
    pub fn is_busy(&self) -> bool {
        self.instance.is_some() || self.restart_in_flight || self.status == InstanceStatus::Starting
    }

    /// Move to Starting. `None` when the agent is already up or launching.
    ///
    /// An Unhealthy or Degraded instance is handed out for stopping so the
    /// caller can replace it.
    pub fn begin_start(&mut self) -> Option<(Option<AgentInstance>, u64)> {
        let replaceable = matches!(self.status, InstanceStatus::Unhealthy | InstanceStatus::Degraded);
        if self.restart_in_flight
            || self.status == InstanceStatus::Starting
            || (self.instance.is_some() && !replaceable)
        {
            return None;
        }
        self.generation += 1;
        self.restart_failures = 0;
        self.last_probe = None;
        self.record(InstanceStatus::Starting, Vec::new());
        Some((self.instance.take(), self.generation))
    }

    /// Install a freshly started instance.
    ///
    /// Returns the instance back when the slot moved on in the meantime.
    pub fn finish_start(&mut self, generation: u64, mut instance: AgentInstance) -> Option<AgentInstance> {
        if generation != self.generation {
            return Some(instance);
        }
        let workers = instance.probe();
        self.record(instance.status(), workers);
        self.last_probe = Some(Instant::now());
        self.instance = Some(instance);
        None
    }

    /// Move to Restarting and hand out the current instance (if any)
    pub fn begin_restart(&mut self) -> Option<(Option<AgentInstance>, u64)> {
        if self.restart_in_flight || self.status == InstanceStatus::Starting {
            return None;
        }
        self.generation += 1;
        self.restart_in_flight = true;
        let cause = self.status;
        let workers = self.last_record.as_ref().map(|r| r.workers.clone()).unwrap_or_default();
        self.record(InstanceStatus::Restarting, workers);
        self.last_record = self.last_record.take().map(|r| r.caused_by(cause));
        Some((self.instance.take(), self.generation))
    }

    /// Install the result of a restart. The next tick re-probes.
    ///
    /// Returns the new instance back when the slot moved on in the meantime.
    pub fn finish_restart(
        &mut self,
        generation: u64,
        result: Result<AgentInstance, String>,
    ) -> Option<AgentInstance> {
        self.restart_in_flight = false;
        if generation != self.generation {
            return result.ok();
        }
        self.last_probe = None;
        match result {
            Ok(mut instance) => {
                let workers = instance.probe();
                self.record(instance.status(), workers);
                self.instance = Some(instance);
            }
            Err(_) => self.record(InstanceStatus::Unhealthy, Vec::new()),
        }
        None
    }

    /// Any state -> Stopped, handing out the instance to stop
    pub fn take_for_stop(&mut self) -> Option<AgentInstance> {
        self.generation += 1;
        self.last_probe = None;
        self.record(InstanceStatus::Stopped, Vec::new());
        self.instance.take()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FleetState {
    pub slots: BTreeMap<String, AgentSlot>,
    pub closed: bool,
}

impl FleetState {
    /// Open slots for newly discovered descriptors.
    ///
    /// Slots that are busy keep the descriptor their instance was launched
    /// from; idle ones pick up the new descriptor.
    pub fn register(&mut self, descriptors: impl IntoIterator<Item = AgentDescriptor>) {
        for descriptor in descriptors {
            let descriptor = Arc::new(descriptor);
            match self.slots.get_mut(&descriptor.id) {
                Some(slot) if !slot.is_busy() => slot.descriptor = descriptor,
                Some(_) => {}
                None => {
                    self.slots.insert(descriptor.id.clone(), AgentSlot::new(descriptor));
                }
            }
        }
    }
}

/// Shared handle to the fleet state
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    inner: Arc<Mutex<FleetState>>,
}

impl Fleet {
    /// Create a fleet with one Stopped slot per descriptor
    pub fn new(descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        let mut state = FleetState::default();
        state.register(descriptors);
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.inner.lock().await
    }

    /// Known agent IDs
    pub async fn agent_ids(&self) -> Vec<String> {
        self.lock().await.slots.keys().cloned().collect()
    }

    pub async fn descriptor(&self, agent_id: &str) -> Option<Arc<AgentDescriptor>> {
        self.lock().await.slots.get(agent_id).map(|s| s.descriptor.clone())
    }

    /// Current status of an agent
    pub async fn status(&self, agent_id: &str) -> Option<InstanceStatus> {
        self.lock().await.slots.get(agent_id).map(|s| s.status)
    }

    /// Latest health record of an agent
    pub async fn health(&self, agent_id: &str) -> Option<HealthRecord> {
        self.lock().await.slots.get(agent_id).and_then(|s| s.last_record.clone())
    }

    /// Latest health record of every agent that has one
    pub async fn snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.lock()
            .await
            .slots
            .iter()
            .filter_map(|(id, slot)| slot.last_record.clone().map(|r| (id.clone(), r)))
            .collect()
    }

    /// Agents with a live instance or a launch in progress
    pub async fn active_agents(&self) -> Vec<String> {
        self.lock()
            .await
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_busy())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn worker_ids(&self, agent_id: &str) -> Vec<WorkerId> {
        self.lock()
            .await
            .slots
            .get(agent_id)
            .and_then(|s| s.instance.as_ref())
            .map(AgentInstance::worker_ids)
            .unwrap_or_default()
    }

    pub async fn worker_pids(&self, agent_id: &str) -> Vec<u32> {
        self.lock()
            .await
            .slots
            .get(agent_id)
            .and_then(|s| s.instance.as_ref())
            .map(AgentInstance::worker_pids)
            .unwrap_or_default()
    }

    /// Consecutive restarts not followed by a healthy probe
    pub async fn restart_failures(&self, agent_id: &str) -> Option<u32> {
        self.lock().await.slots.get(agent_id).map(|s| s.restart_failures)
    }
}
