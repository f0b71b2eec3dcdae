//! Agent descriptors, instance status and health records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, VigilError};

/// Category of workload an agent runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Web crawling workers
    Crawler,
    /// Housekeeping agents
    Maintenance,
    /// Message relay / API front agents
    Communication,
    /// Intelligence processing services
    Intelligence,
    /// Nested orchestrators
    Orchestrator,
    /// Domain specialist agents
    DomainSpecialist,
}

impl AgentKind {
    /// Health-check interval used when a descriptor does not set one
    pub fn default_health_check_interval(&self) -> Duration {
        match self {
            AgentKind::Crawler => Duration::from_secs(30),
            AgentKind::Maintenance => Duration::from_secs(300),
            AgentKind::Communication => Duration::from_secs(30),
            AgentKind::Intelligence => Duration::from_secs(30),
            AgentKind::Orchestrator => Duration::from_secs(15),
            AgentKind::DomainSpecialist => Duration::from_secs(60),
        }
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Crawler => "crawler",
            AgentKind::Maintenance => "maintenance",
            AgentKind::Communication => "communication",
            AgentKind::Intelligence => "intelligence",
            AgentKind::Orchestrator => "orchestrator",
            AgentKind::DomainSpecialist => "domain_specialist",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable launch and governance configuration for one agent.
///
/// Created by [`AgentRegistry`](crate::registry::AgentRegistry) at discovery
/// time and shared read-only with every instance launched from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent ID
    pub id: String,

    /// Workload category
    pub kind: AgentKind,

    /// Directory the workers are launched in
    pub working_dir: PathBuf,

    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Number of independent workers (>= 1)
    pub workers: usize,

    /// Started automatically by `start_all`
    pub autonomous: bool,

    /// OS process (true) or in-process task (false) workers
    pub background: bool,

    /// Minimum time between two probes of this agent
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Restart the agent when a probe finds dead workers
    pub restart_on_failure: bool,

    /// Optional cron-like schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Free-form domain metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AgentDescriptor {
    /// Program to execute
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments passed to the program
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Check the structural invariants of a descriptor
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(VigilError::invalid("<unnamed>", "agent id is empty"));
        }
        if self.command.is_empty() || self.program().trim().is_empty() {
            return Err(VigilError::invalid(&self.id, "command is empty"));
        }
        if self.workers == 0 {
            return Err(VigilError::invalid(&self.id, "workers must be at least 1"));
        }
        Ok(())
    }
}

/// Lifecycle status of an agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Workers are being spawned
    Starting,
    /// Every configured worker is alive
    Running,
    /// Fewer workers than configured were launched
    Degraded,
    /// A probe found dead workers
    Unhealthy,
    /// A restart is in flight
    Restarting,
    /// Not running (explicitly stopped, or restart cap reached)
    Stopped,
}

impl InstanceStatus {
    /// Whether the status counts as a live instance
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Stopped)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Liveness of a single worker as seen by one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLiveness {
    /// Worker identifier
    pub worker_id: String,
    /// OS process ID, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Worker is alive
    pub alive: bool,
    /// Exit status or probe error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Latest health observation for one agent.
///
/// Only the newest record per agent is kept. When a probe finds an agent
/// Unhealthy and a restart begins under the same lock, the stored record is
/// already Restarting; `cause` keeps the status that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Agent ID
    pub agent_id: String,
    /// When the record was produced
    pub timestamp: DateTime<Utc>,
    /// Instance status after the observation
    pub status: InstanceStatus,
    /// Alive workers
    pub alive: usize,
    /// Configured workers
    pub total: usize,
    /// Per-worker detail
    pub workers: Vec<WorkerLiveness>,
    /// Consecutive restarts not followed by a healthy probe
    pub restart_failures: u32,
    /// Status the agent had when a restart was triggered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<InstanceStatus>,
}

impl HealthRecord {
    /// Build a record from per-worker liveness
    pub fn new(
        agent_id: impl Into<String>,
        status: InstanceStatus,
        total: usize,
        workers: Vec<WorkerLiveness>,
        restart_failures: u32,
    ) -> Self {
        let alive = workers.iter().filter(|w| w.alive).count();
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            status,
            alive,
            total,
            workers,
            restart_failures,
            cause: None,
        }
    }

    /// Attach the status that led to this record
    pub fn caused_by(mut self, status: InstanceStatus) -> Self {
        self.cause = Some(status);
        self
    }

    /// Keep timestamps non-decreasing per agent
    pub fn not_before(mut self, previous: Option<&HealthRecord>) -> Self {
        if let Some(prev) = previous {
            if self.timestamp < prev.timestamp {
                self.timestamp = prev.timestamp;
            }
        }
        self
    }

    /// All configured workers are alive
    pub fn all_alive(&self) -> bool {
        self.total > 0 && self.alive == self.total
    }
}

/// Kind of autonomous periodic task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Manifest upkeep and fleet summary
    Maintenance,
    /// Snapshot of every latest health record
    HealthReport,
    /// Flush pending manifest appends
    DataSync,
}

impl TaskKind {
    /// All task kinds in scheduling order
    pub const ALL: [TaskKind; 3] = [TaskKind::Maintenance, TaskKind::HealthReport, TaskKind::DataSync];

    /// Name used in artifact file names
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Maintenance => "maintenance",
            TaskKind::HealthReport => "health_report",
            TaskKind::DataSync => "data_sync",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
