//! Built-in periodic task handlers
//!
//! - `maintenance`: retry pending manifest appends, index stray artifacts and
//!   save a fleet summary
//! - `health_report`: save the latest health record of every agent
//! - `data_sync`: flush pending manifest appends and save the manifest size

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use vigil_core::agent::{HealthRecord, InstanceStatus, TaskKind};
use vigil_core::results::ResultSink;

use crate::lifecycle::Fleet;
use crate::scheduler::TaskHandler;
use crate::Result;

#[derive(Debug, Serialize)]
struct MaintenanceSummary {
    generated_at: DateTime<Utc>,
    agents: usize,
    active: Vec<String>,
    by_status: BTreeMap<String, usize>,
    restart_failures: BTreeMap<String, u32>,
    flushed: usize,
    reconciled: usize,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    generated_at: DateTime<Utc>,
    healthy: usize,
    total: usize,
    agents: BTreeMap<String, HealthRecord>,
}

#[derive(Debug, Serialize)]
struct SyncSummary {
    generated_at: DateTime<Utc>,
    flushed: usize,
    manifest_entries: usize,
    pending: usize,
}

/// Handlers that report on the fleet through the result sink
#[derive(Clone)]
pub struct SupervisorTasks {
    fleet: Fleet,
    sink: Arc<ResultSink>,
}

impl SupervisorTasks {
    pub fn new(fleet: Fleet, sink: Arc<ResultSink>) -> Self {
        Self { fleet, sink }
    }

    async fn maintenance(&self) -> Result<()> {
        let flushed = self.sink.flush_pending().await?;
        let reconciled = self.sink.reconcile().await?;

        let snapshot = self.fleet.snapshot().await;
        let mut by_status = BTreeMap::new();
        let mut restart_failures = BTreeMap::new();
        for (id, record) in &snapshot {
            *by_status.entry(record.status.to_string()).or_insert(0) += 1;
            if record.restart_failures > 0 {
                restart_failures.insert(id.clone(), record.restart_failures);
            }
        }

        let summary = MaintenanceSummary {
            generated_at: Utc::now(),
            agents: self.fleet.agent_ids().await.len(),
            active: self.fleet.active_agents().await,
            by_status,
            restart_failures,
            flushed,
            reconciled,
        };
        self.sink.save(TaskKind::Maintenance.as_str(), &summary).await?;
        info!(flushed, reconciled, "Maintenance sweep complete");
        Ok(())
    }

    async fn health_report(&self) -> Result<()> {
        let agents = self.fleet.snapshot().await;
        let report = HealthReport {
            generated_at: Utc::now(),
            healthy: agents.values().filter(|r| r.status == InstanceStatus::Running).count(),
            total: agents.len(),
            agents,
        };
        self.sink.save(TaskKind::HealthReport.as_str(), &report).await?;
        info!(healthy = report.healthy, total = report.total, "Health report saved");
        Ok(())
    }

    async fn data_sync(&self) -> Result<()> {
        let flushed = self.sink.flush_pending().await?;
        let summary = SyncSummary {
            generated_at: Utc::now(),
            flushed,
            manifest_entries: self.sink.entries().await?.len(),
            pending: self.sink.pending_count().await,
        };
        self.sink.save(TaskKind::DataSync.as_str(), &summary).await?;
        info!(flushed, manifest_entries = summary.manifest_entries, "Data sync complete");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for SupervisorTasks {
    async fn run(&self, kind: TaskKind) -> Result<()> {
        match kind {
            TaskKind::Maintenance => self.maintenance().await,
            TaskKind::HealthReport => self.health_report().await,
            TaskKind::DataSync => self.data_sync().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vigil_core::config::ResultsConfig;
    use vigil_core::results::read_manifest;

    fn tasks(dir: &TempDir) -> SupervisorTasks {
        let sink = ResultSink::new(&ResultsConfig::in_dir(dir.path())).unwrap();
        SupervisorTasks::new(Fleet::default(), Arc::new(sink))
    }

    #[tokio::test]
    async fn test_each_task_saves_one_artifact() {
        let dir = TempDir::new().unwrap();
        let tasks = tasks(&dir);

        for kind in TaskKind::ALL {
            tasks.run(kind).await.unwrap();
        }

        let entries = read_manifest(tasks.sink.manifest_path()).unwrap();
        let sources: Vec<&str> = entries.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(
            sources,
            vec!["supervisor://maintenance", "supervisor://health_report", "supervisor://data_sync"]
        );
        for entry in &entries {
            assert_eq!(std::fs::metadata(&entry.compiled).unwrap().len(), entry.size);
        }
    }

    #[tokio::test]
    async fn test_health_report_counts_fleet() {
        let dir = TempDir::new().unwrap();
        let tasks = tasks(&dir);
        tasks.run(TaskKind::HealthReport).await.unwrap();

        let entries = tasks.sink.entries().await.unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&entries[0].compiled).unwrap()).unwrap();
        assert_eq!(body["total"], 0);
        assert!(body["agents"].as_object().unwrap().is_empty());
    }
}
