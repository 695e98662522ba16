//! Worker supervision with a scripted launcher: restart caps, escalation,
//! manual restarts and ordered start/stop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use junction_core::alert::{list_incidents, AlertSink, RecordingAlertSink};
use junction_core::config::SupervisorConfig;
use junction_core::process::{
    request_restart, ExitInfo, ProcessLauncher, ProcessSupervisor, SupervisorError,
    SupervisorStatus, WorkerHandle, WorkerSpec, WorkerState,
};
use junction_core::{Metrics, StateStore};

#[derive(Default)]
struct Journal {
    spawned: Vec<String>,
    stopped: Vec<String>,
}

/// Workers named in `crashing` exit as soon as they are polled.
struct ScriptedLauncher {
    crashing: HashSet<String>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedLauncher {
    fn new(crashing: &[&str]) -> Self {
        Self {
            crashing: crashing.iter().map(|s| s.to_string()).collect(),
            journal: Arc::default(),
        }
    }
}

struct ScriptedHandle {
    name: String,
    pid: u32,
    crashes: bool,
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl WorkerHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&mut self) -> Option<ExitInfo> {
        self.crashes.then(|| ExitInfo {
            code: Some(1),
            description: "exit status: 1".to_string(),
        })
    }

    async fn stop(&mut self, _timeout: Duration) {
        self.journal.lock().unwrap().stopped.push(self.name.clone());
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let mut journal = self.journal.lock().unwrap();
        journal.spawned.push(spec.name.clone());
        Ok(Box::new(ScriptedHandle {
            name: spec.name.clone(),
            pid: 1_000 + journal.spawned.len() as u32,
            crashes: self.crashing.contains(&spec.name),
            journal: Arc::clone(&self.journal),
        }))
    }
}

fn worker(name: &str) -> WorkerSpec {
    WorkerSpec::new(name, vec!["true".to_string()])
        .with_max_restarts(5)
        .with_restart_delay_ms(0)
}

struct Harness {
    _dir: tempfile::TempDir,
    store: StateStore,
    supervisor: Arc<ProcessSupervisor>,
    alerts: Arc<RecordingAlertSink>,
    journal: Arc<Mutex<Journal>>,
    metrics: Arc<Metrics>,
}

fn harness(workers: Vec<WorkerSpec>, crashing: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let launcher = ScriptedLauncher::new(crashing);
    let journal = Arc::clone(&launcher.journal);
    let alerts = Arc::new(RecordingAlertSink::new());
    let metrics = Arc::new(Metrics::new());
    let config = SupervisorConfig {
        start_spacing_ms: 0,
        stop_timeout_ms: 100,
        workers,
        ..SupervisorConfig::default()
    };
    let supervisor = ProcessSupervisor::new(
        config,
        store.clone(),
        Arc::new(launcher),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
        Arc::clone(&metrics),
    )
    .map(Arc::new)
    .unwrap();
    Harness {
        _dir: dir,
        store,
        supervisor,
        alerts,
        journal,
        metrics,
    }
}

async fn state_of(h: &Harness, name: &str) -> (WorkerState, u32) {
    let status = h.supervisor.status().await;
    let w = status.workers.iter().find(|w| w.name == name).unwrap();
    (w.state, w.restarts)
}

#[tokio::test]
async fn test_critical_worker_exhausts_cap_and_alerts_once() {
    let h = harness(vec![worker("bot").critical()], &["bot"]);
    h.supervisor.start_all().await;

    for _ in 0..8 {
        h.supervisor.check_once().await;
    }

    assert_eq!(state_of(&h, "bot").await, (WorkerState::Failed, 5));
    assert_eq!(h.journal.lock().unwrap().spawned.len(), 6);
    assert_eq!(h.metrics.worker_restarts(), 5);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source, "worker:bot");

    let incidents = list_incidents(&h.store).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].worker, "bot");
    assert_eq!(incidents[0].restarts, 5);
    assert_eq!(incidents[0].last_error.as_deref(), Some("exit status: 1"));
}

#[tokio::test]
async fn test_non_critical_worker_fails_quietly() {
    let h = harness(vec![worker("scraper")], &["scraper"]);
    h.supervisor.start_all().await;
    for _ in 0..8 {
        h.supervisor.check_once().await;
    }
    assert_eq!(state_of(&h, "scraper").await, (WorkerState::Failed, 5));
    assert!(h.alerts.alerts().is_empty());
    assert!(list_incidents(&h.store).unwrap().is_empty());
}

#[tokio::test]
async fn test_healthy_worker_is_left_alone() {
    let h = harness(vec![worker("api")], &[]);
    h.supervisor.start_all().await;
    for _ in 0..3 {
        h.supervisor.check_once().await;
    }
    assert_eq!(state_of(&h, "api").await, (WorkerState::Running, 0));
    assert_eq!(h.journal.lock().unwrap().spawned, vec!["api"]);
}

#[tokio::test]
async fn test_manual_restart_resets_budget_and_alert() {
    let h = harness(vec![worker("bot").critical()], &["bot"]);
    h.supervisor.start_all().await;
    for _ in 0..7 {
        h.supervisor.check_once().await;
    }
    assert_eq!(h.alerts.alerts().len(), 1);

    h.supervisor.restart("bot").await.unwrap();
    assert_eq!(state_of(&h, "bot").await, (WorkerState::Running, 0));

    for _ in 0..7 {
        h.supervisor.check_once().await;
    }
    assert_eq!(state_of(&h, "bot").await, (WorkerState::Failed, 5));
    assert_eq!(h.alerts.alerts().len(), 2);

    assert!(matches!(
        h.supervisor.restart("ghost").await,
        Err(SupervisorError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn test_restart_requests_are_consumed_from_control_dir() {
    let h = harness(vec![worker("api")], &[]);
    h.supervisor.start_all().await;

    request_restart(&h.store, "api").unwrap();
    request_restart(&h.store, "ghost").unwrap();
    assert_eq!(h.supervisor.consume_control().await.unwrap(), 1);
    assert_eq!(h.supervisor.consume_control().await.unwrap(), 0);

    let journal = h.journal.lock().unwrap();
    assert_eq!(journal.spawned, vec!["api", "api"]);
    assert_eq!(journal.stopped, vec!["api"]);
}

#[tokio::test]
async fn test_start_in_dependency_order_stop_in_reverse() {
    let h = harness(
        vec![
            worker("bot").depends_on("api"),
            worker("api").depends_on("db"),
            worker("db"),
        ],
        &[],
    );
    h.supervisor.start_all().await;
    h.supervisor.persist_status().await.unwrap();

    let persisted = SupervisorStatus::load(&h.store).unwrap().unwrap();
    assert!(persisted
        .workers
        .iter()
        .all(|w| w.state == WorkerState::Running && w.pid.is_some()));

    h.supervisor.stop_all().await;
    let journal = h.journal.lock().unwrap();
    assert_eq!(journal.spawned, vec!["db", "api", "bot"]);
    assert_eq!(journal.stopped, vec!["bot", "api", "db"]);
    drop(journal);

    assert_eq!(state_of(&h, "db").await.0, WorkerState::Stopped);
}

#[tokio::test]
async fn test_run_stops_workers_on_shutdown() {
    let h = harness(vec![worker("api")], &[]);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn({
        let supervisor = Arc::clone(&h.supervisor);
        async move { supervisor.run(rx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    let status = SupervisorStatus::load(&h.store).unwrap().unwrap();
    assert_eq!(status.workers[0].state, WorkerState::Stopped);
    assert_eq!(h.journal.lock().unwrap().stopped, vec!["api"]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_delay_is_waited_out_across_ticks() {
    let h = harness(vec![worker("bot").with_restart_delay_ms(1_000)], &["bot"]);
    h.supervisor.start_all().await;

    h.supervisor.check_once().await;
    assert_eq!(state_of(&h, "bot").await, (WorkerState::Down, 1));
    assert_eq!(h.journal.lock().unwrap().spawned.len(), 1);

    // Still inside the delay: no relaunch and no second restart counted.
    tokio::time::advance(Duration::from_millis(500)).await;
    h.supervisor.check_once().await;
    assert_eq!(state_of(&h, "bot").await, (WorkerState::Down, 1));
    assert_eq!(h.journal.lock().unwrap().spawned.len(), 1);

    tokio::time::advance(Duration::from_millis(600)).await;
    h.supervisor.check_once().await;
    assert_eq!(state_of(&h, "bot").await, (WorkerState::Running, 1));
    assert_eq!(h.journal.lock().unwrap().spawned.len(), 2);
}

#[tokio::test]
async fn test_status_stays_responsive_during_start_spacing() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let config = SupervisorConfig {
        start_spacing_ms: 1_000,
        workers: vec![worker("db"), worker("api")],
        ..SupervisorConfig::default()
    };
    let supervisor = Arc::new(
        ProcessSupervisor::new(
            config,
            store,
            Arc::new(ScriptedLauncher::new(&[])),
            Arc::new(RecordingAlertSink::new()) as Arc<dyn AlertSink>,
            Arc::new(Metrics::new()),
        )
        .unwrap(),
    );

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start_all().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = tokio::time::timeout(Duration::from_millis(200), supervisor.status())
        .await
        .expect("status must not wait for the start spacing");
    let states: Vec<_> = status.workers.iter().map(|w| (w.name.as_str(), w.state)).collect();
    assert_eq!(
        states,
        vec![("db", WorkerState::Running), ("api", WorkerState::Pending)]
    );

    starting.await.unwrap();
    assert_eq!(supervisor.status().await.workers[1].state, WorkerState::Running);
}
