//! Scheduler for autonomous periodic tasks
//!
//! Each [`TaskKind`] has at most one [`ScheduledTask`]. On every tick the
//! due tasks are handed to a bounded pool of handler tasks and their next run
//! becomes `now + interval`, however late the tick was. A task whose previous
//! run is still going is skipped for that cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vigil_core::agent::TaskKind;
use vigil_core::config::ScheduleConfig;

use crate::Result;

/// Executes the work behind a task kind
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, kind: TaskKind) -> Result<()>;
}

/// One periodic task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    /// Dispatches so far
    pub runs: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    tasks: BTreeMap<TaskKind, ScheduledTask>,
    in_flight: BTreeSet<TaskKind>,
}

/// Periodic task scheduler
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    handler: Arc<dyn TaskHandler>,
    permits: Arc<Semaphore>,
    handlers: TaskTracker,
}

impl Scheduler {
    /// Schedule every task with a non-zero interval, first run one interval after `start`
    pub fn new(
        schedule: &ScheduleConfig,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        start: DateTime<Utc>,
    ) -> Self {
        let mut tasks = BTreeMap::new();
        for kind in TaskKind::ALL {
            let interval = schedule_interval(schedule, kind);
            if interval.is_zero() {
                info!(task = %kind, "Task disabled");
                continue;
            }
            tasks.insert(
                kind,
                ScheduledTask {
                    kind,
                    interval,
                    next_run: advance(start, interval),
                    last_run: None,
                    runs: 0,
                },
            );
        }

        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                tasks,
                in_flight: BTreeSet::new(),
            })),
            handler,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            handlers: TaskTracker::new(),
        }
    }

    /// Current schedule
    pub async fn tasks(&self) -> Vec<ScheduledTask> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    /// Dispatch every task due at `now`. Returns the dispatched kinds.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<TaskKind> {
        let mut dispatched = Vec::new();
        let mut state = self.state.lock().await;
        let SchedulerState { tasks, in_flight } = &mut *state;

        for task in tasks.values_mut() {
            if task.next_run > now {
                continue;
            }
            task.next_run = advance(now, task.interval);

            if !in_flight.insert(task.kind) {
                warn!(task = %task.kind, "Previous run still in progress, skipping this cycle");
                continue;
            }
            task.last_run = Some(now);
            task.runs += 1;
            dispatched.push(task.kind);
            self.dispatch(task.kind);
        }

        dispatched
    }

    fn dispatch(&self, kind: TaskKind) {
        let handler = self.handler.clone();
        let permits = self.permits.clone();
        let state = self.state.clone();

        self.handlers.spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    debug!(task = %kind, "Running scheduled task");
                    match handler.run(kind).await {
                        Ok(()) => debug!(task = %kind, "Scheduled task finished"),
                        Err(e) => error!(task = %kind, "Scheduled task failed: {}", e),
                    }
                }
                Err(_) => warn!(task = %kind, "Handler pool closed"),
            }
            state.lock().await.in_flight.remove(&kind);
        });
    }

    /// Drive [`run_due`](Self::run_due) every `period` until cancelled
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!(?period, "Scheduler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_due(Utc::now()).await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Wait for running handlers
    pub async fn settle(&self) {
        self.handlers.close();
        self.handlers.wait().await;
        self.handlers.reopen();
    }

    /// Wait for running handlers at shutdown. `false` on timeout.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.handlers.close();
        timeout(limit, self.handlers.wait()).await.is_ok()
    }
}

fn schedule_interval(schedule: &ScheduleConfig, kind: TaskKind) -> Duration {
    match kind {
        TaskKind::Maintenance => schedule.maintenance,
        TaskKind::HealthReport => schedule.health_report,
        TaskKind::DataSync => schedule.data_sync,
    }
}

fn advance(from: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|step| from.checked_add_signed(step))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
