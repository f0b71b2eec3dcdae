//! Worker handles
//!
//! A worker is either a detached OS process (background agents) or an
//! in-process tokio task that drives the command and forwards its output to
//! tracing (non-background agents). Both variants expose the same three
//! capabilities: spawn, probe, terminate.
//!
//! On unix every worker leads its own process group, and termination
//! signals go to the whole group so processes the command starts itself do
//! not outlive the worker.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use vigil_core::agent::{AgentDescriptor, WorkerLiveness};

use crate::{Result, SupervisorError};

/// Unique worker identifier; never reused across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker ended up terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// It was already gone
    AlreadyExited,
    /// It exited within the grace period
    Graceful,
    /// It had to be killed
    Forced,
}

/// Handle to one running worker
#[derive(Debug)]
pub enum WorkerHandle {
    /// OS process
    Process(ProcessWorker),
    /// In-process task
    Task(TaskWorker),
}

impl WorkerHandle {
    /// Spawn worker `index` of `descriptor`
    pub fn spawn(descriptor: &AgentDescriptor, index: usize, log_dir: Option<&Path>) -> Result<Self> {
        let spawned = if descriptor.background {
            ProcessWorker::spawn(descriptor, index, log_dir).map(WorkerHandle::Process)
        } else {
            TaskWorker::spawn(descriptor, index).map(WorkerHandle::Task)
        };

        spawned.map_err(|e| SupervisorError::Launch {
            agent_id: descriptor.id.clone(),
            worker: index,
            reason: e.to_string(),
        })
    }

    /// Worker identifier
    pub fn id(&self) -> WorkerId {
        match self {
            WorkerHandle::Process(w) => w.id,
            WorkerHandle::Task(w) => w.id,
        }
    }

    /// OS process ID of the workload
    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerHandle::Process(w) => w.pid,
            WorkerHandle::Task(w) => w.pid,
        }
    }

    /// Non-blocking liveness check. A probe error counts as dead.
    pub fn probe(&mut self) -> WorkerLiveness {
        let (alive, detail) = match self {
            WorkerHandle::Process(w) => w.probe(),
            WorkerHandle::Task(w) => w.probe(),
        };
        WorkerLiveness {
            worker_id: self.id().to_string(),
            pid: self.pid(),
            alive,
            detail,
        }
    }

    /// Ask the worker to exit, wait up to `grace`, then kill it.
    ///
    /// Fails only when the worker survives the kill as well.
    pub async fn terminate(&mut self, grace: Duration, kill_timeout: Duration) -> Result<StopOutcome> {
        match self {
            WorkerHandle::Process(w) => w.terminate(grace, kill_timeout).await,
            WorkerHandle::Task(w) => w.terminate(grace, kill_timeout).await,
        }
    }
}

/// Worker running as a detached OS process
#[derive(Debug)]
pub struct ProcessWorker {
    id: WorkerId,
    agent_id: String,
    pid: Option<u32>,
    child: Child,
    exited: Option<ExitStatus>,
}

impl ProcessWorker {
    fn spawn(descriptor: &AgentDescriptor, index: usize, log_dir: Option<&Path>) -> std::io::Result<Self> {
        let mut cmd = Command::new(descriptor.program());
        cmd.args(descriptor.args())
            .current_dir(&descriptor.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        match log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}-{}.log", descriptor.id, index)))?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn()?;
        let worker = Self {
            id: WorkerId::new(),
            agent_id: descriptor.id.clone(),
            pid: child.id(),
            child,
            exited: None,
        };
        debug!(agent_id = %worker.agent_id, worker = %worker.id, pid = ?worker.pid, "Spawned worker process");
        Ok(worker)
    }

    fn probe(&mut self) -> (bool, Option<String>) {
        if let Some(status) = self.exited {
            return (false, Some(status.to_string()));
        }
        match self.child.try_wait() {
            Ok(None) => (true, None),
            Ok(Some(status)) => {
                self.exited = Some(status);
                (false, Some(status.to_string()))
            }
            Err(e) => {
                let err = SupervisorError::HealthProbe {
                    worker_id: self.id.to_string(),
                    reason: e.to_string(),
                };
                warn!(agent_id = %self.agent_id, "{}", err);
                (false, Some(err.to_string()))
            }
        }
    }

    async fn terminate(&mut self, grace: Duration, kill_timeout: Duration) -> Result<StopOutcome> {
        let (alive, _) = self.probe();
        if !alive && self.exited.is_some() {
            kill_group(self.pid, &self.agent_id, self.id);
            return Ok(StopOutcome::AlreadyExited);
        }

        if let Err(e) = request_termination(&mut self.child) {
            warn!(agent_id = %self.agent_id, worker = %self.id, "Failed to send termination request: {}", e);
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exited = Some(status);
                kill_group(self.pid, &self.agent_id, self.id);
                return Ok(StopOutcome::Graceful);
            }
            Ok(Err(e)) => {
                warn!(agent_id = %self.agent_id, worker = %self.id, "Error waiting for worker exit: {}", e);
            }
            Err(_) => {
                warn!(
                    agent_id = %self.agent_id,
                    worker = %self.id,
                    pid = ?self.pid,
                    "Worker did not exit within {:?}, force killing",
                    grace
                );
            }
        }

        let agent_id = self.agent_id.clone();
        let worker_id = self.id.to_string();
        let stop_error = move |reason: String| SupervisorError::Stop {
            agent_id: agent_id.clone(),
            worker_id: worker_id.clone(),
            reason,
        };

        kill_group(self.pid, &self.agent_id, self.id);
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the child was already reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(stop_error(e.to_string()));
            }
        }
        match timeout(kill_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exited = Some(status);
                Ok(StopOutcome::Forced)
            }
            Ok(Err(e)) => Err(stop_error(e.to_string())),
            Err(_) => Err(stop_error(format!("still alive {:?} after kill", kill_timeout))),
        }
    }
}

/// Worker running as an in-process task that owns its command
#[derive(Debug)]
pub struct TaskWorker {
    id: WorkerId,
    agent_id: String,
    pid: Option<u32>,
    cancel: CancellationToken,
    join: JoinHandle<String>,
    exit: Option<String>,
}

impl TaskWorker {
    fn spawn(descriptor: &AgentDescriptor, index: usize) -> std::io::Result<Self> {
        let mut cmd = Command::new(descriptor.program());
        cmd.args(descriptor.args())
            .current_dir(&descriptor.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;

        let id = WorkerId::new();
        let agent_id = descriptor.id.clone();
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, agent_id.clone(), id, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, agent_id.clone(), id, "stderr"));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                },
                _ = token.cancelled() => {
                    let _ = request_termination(&mut child);
                    match child.wait().await {
                        Ok(status) => format!("cancelled ({})", status),
                        Err(e) => format!("cancelled, wait failed: {}", e),
                    }
                }
            }
        });

        debug!(agent_id = %agent_id, worker = %id, worker_index = index, pid = ?pid, "Spawned worker task");
        Ok(Self {
            id,
            agent_id,
            pid,
            cancel,
            join,
            exit: None,
        })
    }

    fn probe(&mut self) -> (bool, Option<String>) {
        if self.exit.is_some() {
            return (false, self.exit.clone());
        }
        if !self.join.is_finished() {
            return (true, None);
        }
        let detail = match (&mut self.join).now_or_never() {
            Some(Ok(detail)) => detail,
            Some(Err(e)) => format!("task failed: {}", e),
            None => "task finished".to_string(),
        };
        self.exit = Some(detail.clone());
        (false, Some(detail))
    }

    async fn terminate(&mut self, grace: Duration, kill_timeout: Duration) -> Result<StopOutcome> {
        let (alive, _) = self.probe();
        if !alive {
            kill_group(self.pid, &self.agent_id, self.id);
            return Ok(StopOutcome::AlreadyExited);
        }

        self.cancel.cancel();
        match timeout(grace, &mut self.join).await {
            Ok(result) => {
                self.exit = Some(result.unwrap_or_else(|e| format!("task failed: {}", e)));
                kill_group(self.pid, &self.agent_id, self.id);
                return Ok(StopOutcome::Graceful);
            }
            Err(_) => {
                warn!(
                    agent_id = %self.agent_id,
                    worker = %self.id,
                    pid = ?self.pid,
                    "Worker task did not exit within {:?}, force killing",
                    grace
                );
            }
        }

        // Aborting drops the child, and kill_on_drop kills it
        kill_group(self.pid, &self.agent_id, self.id);
        self.join.abort();
        match timeout(kill_timeout, &mut self.join).await {
            Ok(_) => {
                self.exit = Some("killed".to_string());
                Ok(StopOutcome::Forced)
            }
            Err(_) => Err(SupervisorError::Stop {
                agent_id: self.agent_id.clone(),
                worker_id: self.id.to_string(),
                reason: format!("task still running {:?} after abort", kill_timeout),
            }),
        }
    }
}

/// Send SIGTERM to the worker's group (or kill where there are no signals)
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        match child.id() {
            Some(pid) => signal_group(pid, libc::SIGTERM),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

/// SIGKILL whatever is left of the worker's process group
fn kill_group(pid: Option<u32>, agent_id: &str, worker: WorkerId) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                warn!(agent_id, worker = %worker, pid, "Failed to kill process group: {}", e);
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, agent_id, worker);
}

/// Signal every process in the group led by `pid`. An empty group is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

async fn forward_lines<R>(reader: R, agent_id: String, worker: WorkerId, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(agent_id = %agent_id, worker = %worker, stream, "{}", line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vigil_core::agent::AgentKind;

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

    fn descriptor(script: &str, background: bool) -> AgentDescriptor {
        AgentDescriptor {
            id: "worker-test".to_string(),
            kind: AgentKind::Maintenance,
            working_dir: std::env::temp_dir(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            workers: 1,
            autonomous: true,
            background,
            health_check_interval: Duration::ZERO,
            restart_on_failure: true,
            schedule: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_process_worker_graceful_stop() {
        let mut worker = WorkerHandle::spawn(&descriptor("sleep 30", true), 0, None).unwrap();
        assert!(worker.pid().is_some());
        assert!(worker.probe().alive);

        let outcome = worker
            .terminate(Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!worker.probe().alive);
    }

    #[tokio::test]
    async fn test_process_worker_ignoring_sigterm_is_killed() {
        let mut worker =
            WorkerHandle::spawn(&descriptor("trap '' TERM; sleep 30", true), 0, None).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = worker
            .terminate(Duration::from_millis(300), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
    }

    #[tokio::test]
    async fn test_task_worker_ignoring_sigterm_is_killed() {
        let mut worker =
            WorkerHandle::spawn(&descriptor("trap '' TERM; sleep 30", false), 0, None).unwrap();
        assert!(matches!(worker, WorkerHandle::Task(_)));
        let pid = worker.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = worker
            .terminate(Duration::from_millis(300), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(!worker.probe().alive);
        assert!(wait_gone(pid).await, "worker {} still running", pid);
    }

    #[tokio::test]
    async fn test_terminate_reaches_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());

        for background in [true, false] {
            let _ = std::fs::remove_file(&pidfile);
            let mut worker = WorkerHandle::spawn(&descriptor(&script, background), 0, None).unwrap();
            let grandchild = read_pid(&pidfile).await;

            let outcome = worker
                .terminate(Duration::from_secs(5), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(outcome, StopOutcome::Graceful);
            assert!(wait_gone(grandchild).await, "grandchild {} survived", grandchild);
        }
    }

    #[tokio::test]
    async fn test_probe_sees_exit() {
        let mut worker = WorkerHandle::spawn(&descriptor("exit 3", true), 0, None).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let liveness = worker.probe();
        assert!(!liveness.alive);
        assert!(liveness.detail.unwrap().contains('3'));

        let outcome = worker
            .terminate(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn test_task_worker_lifecycle() {
        let mut worker = WorkerHandle::spawn(&descriptor("echo hello; sleep 30", false), 0, None).unwrap();
        assert!(matches!(worker, WorkerHandle::Task(_)));
        assert!(worker.probe().alive);

        let outcome = worker
            .terminate(Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!worker.probe().alive);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let mut d = descriptor("true", true);
        d.command = vec!["/nonexistent/vigil-worker".to_string()];
        let err = WorkerHandle::spawn(&d, 2, None).unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { worker: 2, .. }));
    }

    #[tokio::test]
    async fn test_background_output_goes_to_log_dir() {
        let logs = tempfile::TempDir::new().unwrap();
        let mut worker =
            WorkerHandle::spawn(&descriptor("echo ready", true), 1, Some(logs.path())).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker
            .terminate(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        let log = std::fs::read_to_string(logs.path().join("worker-test-1.log")).unwrap();
        assert_eq!(log.trim(), "ready");
    }
}
