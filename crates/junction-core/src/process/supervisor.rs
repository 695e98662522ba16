//! Worker lifecycle: start in dependency order, monitor, restart under a
//! cap, escalate, stop in reverse order.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::alert::{write_incident, AlertSink, IncidentRecord, OperatorAlert};
use crate::config::SupervisorConfig;
use crate::domain::{JunctionError, Result};
use crate::metrics::Metrics;
use crate::obs;
use crate::store::{read_json, write_atomic, write_json, StateStore};

use super::error::SupervisorError;
use super::launcher::{ProcessLauncher, WorkerHandle};
use super::spec::{launch_order, HealthProbe, WorkerSpec};

const RESTART_PREFIX: &str = "restart-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Pending,
    Running,
    /// Exited or unhealthy; waiting for the next monitor tick.
    Down,
    Stopped,
    /// Not restarted any more: cap exhausted or auto-restart disabled.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub max_restarts: u32,
    pub critical: bool,
    pub last_exit: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub updated_at: DateTime<Utc>,
    pub supervisor_pid: u32,
    pub workers: Vec<WorkerStatus>,
}

impl SupervisorStatus {
    pub fn path(store: &StateStore) -> std::path::PathBuf {
        store.supervisor_dir().join("status.json")
    }

    /// Last status written by a running supervisor.
    pub fn load(store: &StateStore) -> Result<Option<Self>> {
        match read_json(&Self::path(store)) {
            Ok(s) => Ok(Some(s)),
            Err(JunctionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct Worker {
    spec: WorkerSpec,
    handle: Option<Box<dyn WorkerHandle>>,
    status: WorkerStatus,
    started: Option<Instant>,
    /// A counted restart waiting out its delay; relaunched on a later tick.
    restart_at: Option<tokio::time::Instant>,
    alerted: bool,
}

impl Worker {
    fn new(spec: WorkerSpec) -> Self {
        let status = WorkerStatus {
            name: spec.name.clone(),
            state: WorkerState::Pending,
            pid: None,
            restarts: 0,
            max_restarts: spec.max_restarts,
            critical: spec.critical,
            last_exit: None,
            started_at: None,
        };
        Self {
            spec,
            handle: None,
            status,
            started: None,
            restart_at: None,
            alerted: false,
        }
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    store: StateStore,
    launcher: Arc<dyn ProcessLauncher>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<Metrics>,
    /// In launch order.
    workers: Mutex<Vec<Worker>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        store: StateStore,
        launcher: Arc<dyn ProcessLauncher>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<Metrics>,
    ) -> std::result::Result<Self, SupervisorError> {
        let workers = launch_order(&config.workers)?
            .into_iter()
            .cloned()
            .map(Worker::new)
            .collect();
        Ok(Self {
            config,
            store,
            launcher,
            alerts,
            metrics,
            workers: Mutex::new(workers),
        })
    }

    /// Launch every worker in dependency order with the configured spacing.
    /// A worker that fails to spawn is left `Down` for the monitor to retry.
    /// The workers lock is released between launches.
    pub async fn start_all(&self) {
        let count = self.workers.lock().await.len();
        for i in 0..count {
            {
                let mut workers = self.workers.lock().await;
                if let Some(worker) = workers.get_mut(i) {
                    self.launch(worker).await;
                }
            }
            if i + 1 < count && !self.config.start_spacing().is_zero() {
                tokio::time::sleep(self.config.start_spacing()).await;
            }
        }
    }

    async fn launch(&self, worker: &mut Worker) {
        match self.launcher.spawn(&worker.spec).await {
            Ok(handle) => {
                worker.status.pid = handle.pid();
                worker.handle = Some(handle);
                worker.status.state = WorkerState::Running;
                worker.status.started_at = Some(Utc::now());
                worker.started = Some(Instant::now());
                info!(worker = %worker.spec.name, pid = ?worker.status.pid, "worker started");
            }
            Err(e) => {
                warn!(worker = %worker.spec.name, error = %e, "worker failed to start");
                worker.handle = None;
                worker.status.pid = None;
                worker.status.state = WorkerState::Down;
                worker.status.last_exit = Some(e.to_string());
            }
        }
    }

    /// One monitor pass: detect exits and failed health predicates, restart
    /// under the cap, escalate exhaustion.
    pub async fn check_once(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.iter_mut() {
            if matches!(
                worker.status.state,
                WorkerState::Stopped | WorkerState::Failed | WorkerState::Pending
            ) {
                continue;
            }

            if worker.status.state == WorkerState::Running {
                let exited = worker.handle.as_mut().and_then(|h| h.try_exit());
                if let Some(exit) = exited {
                    warn!(worker = %worker.spec.name, status = %exit.description, "worker exited");
                    worker.status.last_exit = Some(exit.description);
                    worker.handle = None;
                    worker.status.pid = None;
                    worker.status.state = WorkerState::Down;
                } else if !self.healthy(worker).await {
                    warn!(worker = %worker.spec.name, "worker failed its health check");
                    if let Some(mut handle) = worker.handle.take() {
                        handle.stop(self.config.stop_timeout()).await;
                    }
                    worker.status.last_exit = Some("health check failed".to_string());
                    worker.status.pid = None;
                    worker.status.state = WorkerState::Down;
                }
            }

            if worker.status.state == WorkerState::Down {
                self.recover(worker).await;
            }
        }
    }

    async fn recover(&self, worker: &mut Worker) {
        if let Some(at) = worker.restart_at {
            if tokio::time::Instant::now() < at {
                return;
            }
            worker.restart_at = None;
            self.launch(worker).await;
            return;
        }
        if !worker.spec.auto_restart {
            worker.status.state = WorkerState::Failed;
            info!(worker = %worker.spec.name, "auto-restart disabled, leaving worker down");
            return;
        }
        if worker.status.restarts >= worker.spec.max_restarts {
            worker.status.state = WorkerState::Failed;
            error!(
                worker = %worker.spec.name,
                restarts = worker.status.restarts,
                "restart cap exhausted"
            );
            if worker.spec.critical && !worker.alerted {
                worker.alerted = true;
                self.escalate(worker);
            }
            return;
        }

        worker.status.restarts += 1;
        self.metrics.inc_worker_restarts();
        obs::emit_worker_restarted(&worker.spec.name, worker.status.restarts, worker.spec.max_restarts);
        if worker.spec.restart_delay_ms > 0 {
            let delay = Duration::from_millis(worker.spec.restart_delay_ms);
            worker.restart_at = Some(tokio::time::Instant::now() + delay);
            debug!(worker = %worker.spec.name, delay_ms = worker.spec.restart_delay_ms, "restart scheduled");
            return;
        }
        self.launch(worker).await;
    }

    fn escalate(&self, worker: &Worker) {
        let alert = OperatorAlert::new(
            format!("worker:{}", worker.spec.name),
            format!("critical worker {} is down", worker.spec.name),
            format!(
                "restart cap of {} exhausted; last exit: {}",
                worker.spec.max_restarts,
                worker.status.last_exit.as_deref().unwrap_or("unknown")
            ),
        );
        self.alerts.notify(&alert);

        let incident = IncidentRecord {
            id: format!("{}-{}", alert.timestamp.format("%Y%m%dT%H%M%S%3f"), worker.spec.name),
            opened_at: alert.timestamp,
            worker: worker.spec.name.clone(),
            restarts: worker.status.restarts,
            max_restarts: worker.spec.max_restarts,
            last_error: worker.status.last_exit.clone(),
            alert,
        };
        if let Err(e) = write_incident(&self.store, &incident) {
            error!(worker = %worker.spec.name, error = %e, "failed to persist incident");
        }
    }

    async fn healthy(&self, worker: &Worker) -> bool {
        match &worker.spec.health {
            None => true,
            Some(HealthProbe::Command {
                command,
                timeout_ms,
            }) => probe_command(command, Duration::from_millis(*timeout_ms)).await,
            Some(HealthProbe::HeartbeatFile { path, max_age_secs }) => {
                let since_start = worker.started.map(|s| s.elapsed()).unwrap_or_default();
                heartbeat_fresh(path, Duration::from_secs(*max_age_secs), since_start)
            }
        }
    }

    /// Operator restart. Does not count against the cap and resets it, so a
    /// worker that had given up gets a fresh budget.
    pub async fn restart(&self, name: &str) -> std::result::Result<(), SupervisorError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .iter_mut()
            .find(|w| w.spec.name == name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        if let Some(mut handle) = worker.handle.take() {
            handle.stop(self.config.stop_timeout()).await;
        }
        worker.status.restarts = 0;
        worker.restart_at = None;
        worker.alerted = false;
        info!(worker = %name, "manual restart");
        self.launch(worker).await;
        Ok(())
    }

    /// Stop every worker in reverse launch order.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.iter_mut().rev() {
            if let Some(mut handle) = worker.handle.take() {
                info!(worker = %worker.spec.name, "stopping worker");
                handle.stop(self.config.stop_timeout()).await;
            }
            worker.status.pid = None;
            worker.restart_at = None;
            worker.status.state = WorkerState::Stopped;
        }
    }

    pub async fn status(&self) -> SupervisorStatus {
        let workers = self.workers.lock().await;
        SupervisorStatus {
            updated_at: Utc::now(),
            supervisor_pid: std::process::id(),
            workers: workers.iter().map(|w| w.status.clone()).collect(),
        }
    }

    pub async fn persist_status(&self) -> Result<()> {
        let status = self.status().await;
        write_json(&SupervisorStatus::path(&self.store), &status)
    }

    /// Apply restart requests dropped into the control directory.
    pub async fn consume_control(&self) -> Result<usize> {
        let dir = control_dir(&self.store);
        if !dir.exists() {
            return Ok(0);
        }
        let mut applied = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(RESTART_PREFIX))
                .map(str::to_string)
            else {
                continue;
            };
            std::fs::remove_file(&path)?;
            match self.restart(&name).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(worker = %name, error = %e, "restart request rejected"),
            }
        }
        Ok(applied)
    }

    /// Start everything, then monitor until `shutdown` flips to `true`, then
    /// stop everything.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.start_all().await;
        if let Err(e) = self.persist_status().await {
            warn!(error = %e, "failed to persist supervisor status");
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.consume_control().await {
                        warn!(error = %e, "failed to read control requests");
                    }
                    self.check_once().await;
                    if let Err(e) = self.persist_status().await {
                        warn!(error = %e, "failed to persist supervisor status");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("process supervisor stopping");
        self.stop_all().await;
        if let Err(e) = self.persist_status().await {
            warn!(error = %e, "failed to persist supervisor status");
        }
    }
}

fn control_dir(store: &StateStore) -> std::path::PathBuf {
    store.supervisor_dir().join("control")
}

/// Ask a running supervisor to restart `worker` on its next tick.
pub fn request_restart(store: &StateStore, worker: &str) -> Result<()> {
    crate::domain::signal::validate_id(worker)?;
    let path = control_dir(store).join(format!("{RESTART_PREFIX}{worker}"));
    write_atomic(&path, Utc::now().to_rfc3339().as_bytes())
}

pub fn pid_file(store: &StateStore) -> std::path::PathBuf {
    store.supervisor_dir().join("supervisor.pid")
}

pub fn write_pid_file(store: &StateStore) -> Result<()> {
    write_atomic(&pid_file(store), std::process::id().to_string().as_bytes())
}

pub fn read_pid_file(store: &StateStore) -> Result<Option<u32>> {
    match std::fs::read_to_string(pid_file(store)) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn remove_pid_file(store: &StateStore) -> Result<()> {
    match std::fs::remove_file(pid_file(store)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn probe_command(command: &[String], timeout: Duration) -> bool {
    let Some((exe, args)) = command.split_first() else {
        return false;
    };
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    matches!(tokio::time::timeout(timeout, cmd.status()).await, Ok(Ok(s)) if s.success())
}

/// A heartbeat is fresh when the file changed within `max_age`. A worker
/// gets `max_age` after start to write its first beat.
fn heartbeat_fresh(path: &Path, max_age: Duration, since_start: Duration) -> bool {
    let modified = std::fs::metadata(path).and_then(|m| m.modified());
    match modified {
        Ok(at) => SystemTime::now()
            .duration_since(at)
            .map(|age| age <= max_age)
            .unwrap_or(true),
        Err(_) => since_start <= max_age,
    }
}
