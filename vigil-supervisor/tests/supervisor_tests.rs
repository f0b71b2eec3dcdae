//! End-to-end supervisor behavior against real `sh` workers
#![cfg(unix)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vigil_core::agent::{AgentDescriptor, AgentKind, InstanceStatus};
use vigil_core::config::{ResultsConfig, ScheduleConfig, SupervisorSettings, VigilConfig};
use vigil_core::registry::DescriptorSpec;
use vigil_supervisor::{
    AgentInstance, Launcher, LauncherConfig, ProcessLauncher, StopReport, Supervisor,
};

fn agent(id: &str, script: &str, workers: usize) -> DescriptorSpec {
    DescriptorSpec {
        id: id.to_string(),
        kind: Some(AgentKind::Crawler),
        working_dir: std::env::temp_dir(),
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        workers: Some(workers),
        health_check_interval: Some(Duration::ZERO),
        ..Default::default()
    }
}

fn config(dir: &TempDir, agents: Vec<DescriptorSpec>) -> VigilConfig {
    VigilConfig {
        supervisor: SupervisorSettings {
            stop_grace_period: Duration::from_secs(2),
            loop_shutdown_timeout: Duration::from_secs(5),
            max_restart_failures: 3,
            ..Default::default()
        },
        results: ResultsConfig::in_dir(dir.path().join("results")),
        agents,
        ..Default::default()
    }
}

fn launcher(config: &VigilConfig) -> ProcessLauncher {
    ProcessLauncher::new(LauncherConfig::from(&config.supervisor))
}

/// Alive and not a zombie
fn pid_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| rest.trim_start().starts_with('Z')),
        Err(_) => !Path::new("/proc/self").exists(),
    }
}

async fn wait_gone(pid: u32) -> bool {
    for _ in 0..40 {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn read_pid(path: &Path) -> u32 {
    for _ in 0..40 {
        if let Ok(Ok(pid)) = std::fs::read_to_string(path).map(|s| s.trim().parse::<u32>()) {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no pid written to {}", path.display());
}

fn kill(pid: u32) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0, "failed to kill {}", pid);
}

/// Counts launches through the wrapped launcher
struct CountingLauncher {
    inner: ProcessLauncher,
    starts: AtomicUsize,
}

#[async_trait]
impl Launcher for CountingLauncher {
    async fn start(&self, descriptor: Arc<AgentDescriptor>) -> AgentInstance {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start(descriptor).await
    }

    async fn stop(&self, instance: AgentInstance) -> vigil_supervisor::Result<StopReport> {
        self.inner.stop(instance).await
    }
}

#[tokio::test]
async fn test_start_then_stop_leaves_nothing_running() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(&config(&dir, vec![agent("sleeper", "sleep 30", 2)])).unwrap();
    assert_eq!(supervisor.discover().await.discovered, 1);

    let status = supervisor.start_agent("sleeper").await.unwrap();
    assert_eq!(status, InstanceStatus::Running);
    assert_eq!(supervisor.active_agents().await, vec!["sleeper"]);

    let pids = supervisor.fleet().worker_pids("sleeper").await;
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|pid| pid_alive(*pid)));

    let report = supervisor.stop_agent("sleeper").await.unwrap();
    assert_eq!(report.graceful, 2);

    assert!(supervisor.active_agents().await.is_empty());
    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    assert_eq!(
        supervisor.health("sleeper").await.unwrap().status,
        InstanceStatus::Stopped
    );
}

#[tokio::test]
async fn test_starting_a_running_agent_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(&config(&dir, vec![agent("sleeper", "sleep 30", 1)])).unwrap();
    supervisor.discover().await;

    supervisor.start_agent("sleeper").await.unwrap();
    let before = supervisor.fleet().worker_ids("sleeper").await;
    assert_eq!(supervisor.start_agent("sleeper").await.unwrap(), InstanceStatus::Running);
    assert_eq!(supervisor.fleet().worker_ids("sleeper").await, before);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_restart_replaces_every_worker() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(&config(&dir, vec![agent("sleeper", "sleep 30", 3)])).unwrap();
    supervisor.discover().await;
    supervisor.start_agent("sleeper").await.unwrap();

    let before: BTreeSet<_> = supervisor.fleet().worker_ids("sleeper").await.into_iter().collect();
    let old_pids = supervisor.fleet().worker_pids("sleeper").await;

    let status = supervisor.restart_agent("sleeper").await.unwrap();
    assert_eq!(status, InstanceStatus::Running);

    let after: BTreeSet<_> = supervisor.fleet().worker_ids("sleeper").await.into_iter().collect();
    assert_eq!(after.len(), 3);
    assert!(before.is_disjoint(&after));
    assert!(old_pids.iter().all(|pid| !pid_alive(*pid)));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_kills_processes_started_by_workers() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("grandchild.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
    let supervisor = Supervisor::new(&config(&dir, vec![agent("spawner", &script, 1)])).unwrap();

    supervisor.start_all().await.unwrap();
    let grandchild = read_pid(&pidfile).await;
    assert!(pid_alive(grandchild));

    let report = supervisor.stop_all().await;
    assert_eq!(report.stopped, vec!["spawner"]);
    assert!(report.is_clean());
    assert!(wait_gone(grandchild).await, "grandchild {} survived stop_all", grandchild);
}

#[tokio::test]
async fn test_start_replaces_dead_agent_without_restarts() {
    let dir = TempDir::new().unwrap();
    let mut spec = agent("oneshot", "sleep 0.2; exit 1", 2);
    spec.restart_on_failure = Some(false);
    let supervisor = Supervisor::new(&config(&dir, vec![spec])).unwrap();
    supervisor.discover().await;

    assert_eq!(supervisor.start_agent("oneshot").await.unwrap(), InstanceStatus::Running);
    let before: BTreeSet<_> = supervisor.fleet().worker_ids("oneshot").await.into_iter().collect();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let records = supervisor.monitor().tick().await;
    assert_eq!(records[0].status, InstanceStatus::Unhealthy);
    assert_eq!(records[0].alive, 0);
    supervisor.monitor().settle().await;
    assert_eq!(supervisor.fleet().worker_ids("oneshot").await.len(), 2);

    assert_eq!(supervisor.start_agent("oneshot").await.unwrap(), InstanceStatus::Running);
    let after: BTreeSet<_> = supervisor.fleet().worker_ids("oneshot").await.into_iter().collect();
    assert_eq!(after.len(), 2);
    assert!(before.is_disjoint(&after));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_unlaunchable_agent_is_degraded() {
    let dir = TempDir::new().unwrap();
    let mut spec = agent("ghost", "", 2);
    spec.command = vec!["/nonexistent/ghost-agent".to_string()];
    spec.restart_on_failure = Some(false);
    let supervisor = Supervisor::new(&config(&dir, vec![spec])).unwrap();
    supervisor.discover().await;

    let status = supervisor.start_agent("ghost").await.unwrap();
    assert_eq!(status, InstanceStatus::Degraded);

    let record = supervisor.health("ghost").await.unwrap();
    assert_eq!(record.status, InstanceStatus::Degraded);
    assert_eq!(record.alive, 0);
    assert_eq!(record.total, 2);

    assert!(supervisor.stop_all().await.is_clean());
}

#[tokio::test]
async fn test_killed_worker_is_restarted() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(&config(&dir, vec![agent("crawler-a", "sleep 30", 3)])).unwrap();
    supervisor.discover().await;

    assert_eq!(supervisor.start_agent("crawler-a").await.unwrap(), InstanceStatus::Running);
    let before: BTreeSet<_> = supervisor.fleet().worker_ids("crawler-a").await.into_iter().collect();
    let pids = supervisor.fleet().worker_pids("crawler-a").await;
    assert_eq!(pids.len(), 3);

    kill(pids[0]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let records = supervisor.monitor().tick().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, InstanceStatus::Restarting);
    assert_eq!(records[0].cause, Some(InstanceStatus::Unhealthy));
    assert_eq!(records[0].alive, 2);
    assert_eq!(records[0].total, 3);

    supervisor.monitor().settle().await;
    let after: BTreeSet<_> = supervisor.fleet().worker_ids("crawler-a").await.into_iter().collect();
    assert_eq!(after.len(), 3);
    assert!(before.is_disjoint(&after));

    let records = supervisor.monitor().tick().await;
    assert_eq!(records[0].status, InstanceStatus::Running);
    assert_eq!(records[0].alive, 3);
    assert_eq!(supervisor.fleet().restart_failures("crawler-a").await, Some(0));

    let report = supervisor.stop_all().await;
    assert_eq!(report.stopped, vec!["crawler-a"]);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_restart_cap_stops_crashing_agent() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, vec![agent("crasher", "exit 1", 1)]);
    let launcher = Arc::new(CountingLauncher {
        inner: launcher(&config),
        starts: AtomicUsize::new(0),
    });
    let supervisor = Supervisor::with_launcher(&config, launcher.clone()).unwrap();
    supervisor.discover().await;
    supervisor.start_agent("crasher").await.unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        supervisor.monitor().tick().await;
        supervisor.monitor().settle().await;
        if supervisor.fleet().status("crasher").await == Some(InstanceStatus::Stopped) {
            break;
        }
    }

    assert_eq!(supervisor.fleet().status("crasher").await, Some(InstanceStatus::Stopped));
    // One initial launch plus exactly three restarts
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 4);
    assert_eq!(supervisor.fleet().restart_failures("crasher").await, Some(3));

    supervisor.monitor().tick().await;
    supervisor.monitor().settle().await;
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 4);
    assert!(supervisor.active_agents().await.is_empty());

    // An explicit start re-arms the agent
    supervisor.start_agent("crasher").await.unwrap();
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 5);
    assert_eq!(supervisor.fleet().restart_failures("crasher").await, Some(0));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_is_idempotent_and_complete() {
    let dir = TempDir::new().unwrap();
    let mut inline = agent("inline", "sleep 30", 2);
    inline.background = Some(false);
    let mut manual = agent("manual", "sleep 30", 1);
    manual.autonomous = Some(false);
    let supervisor = Supervisor::new(&config(
        &dir,
        vec![agent("detached", "sleep 30", 2), inline, manual],
    ))
    .unwrap();

    let started = supervisor.start_all().await.unwrap();
    assert_eq!(started.discovered, 3);
    assert_eq!(started.started.len(), 2);
    assert!(!started.started.contains_key("manual"));

    let mut pids = supervisor.fleet().worker_pids("detached").await;
    pids.extend(supervisor.fleet().worker_pids("inline").await);
    assert_eq!(pids.len(), 4);

    let (first, second) = tokio::join!(supervisor.stop_all(), supervisor.stop_all());
    assert_eq!(first.stopped, second.stopped);
    assert_eq!(first.stopped, vec!["detached", "inline"]);
    assert!(first.is_clean());

    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    assert!(supervisor.active_agents().await.is_empty());
    assert_eq!(supervisor.stop_all().await.stopped, first.stopped);
    assert!(supervisor.start_agent("manual").await.is_err());
}

#[tokio::test]
async fn test_stubborn_worker_is_force_killed() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, vec![agent("stubborn", "trap '' TERM; sleep 30", 1)]);
    config.supervisor.stop_grace_period = Duration::from_millis(300);
    let supervisor = Supervisor::new(&config).unwrap();
    supervisor.discover().await;
    supervisor.start_agent("stubborn").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = supervisor.stop_all().await;
    assert_eq!(report.forced, 1);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_scheduled_tasks_write_artifacts() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, Vec::new());
    config.schedule = ScheduleConfig {
        maintenance: Duration::from_secs(60),
        health_report: Duration::from_secs(60),
        data_sync: Duration::ZERO,
    };
    let supervisor = Supervisor::new(&config).unwrap();

    let later = chrono::Utc::now() + chrono::Duration::minutes(2);
    assert_eq!(supervisor.scheduler().run_due(later).await.len(), 2);
    supervisor.scheduler().settle().await;

    let entries = supervisor.sink().entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert_eq!(std::fs::metadata(&entry.compiled).unwrap().len(), entry.size);
    }
}
