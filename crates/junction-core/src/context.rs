//! The one explicit context constructed at process start.
//!
//! Every long-lived component (hub, pipeline executor, health and process
//! supervisors) is built from, and shares state through, a
//! [`JunctionContext`]. There is no process-global instance.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alert::{AlertSink, TracingAlertSink};
use crate::config::JunctionConfig;
use crate::domain::Result;
use crate::fanout::ResultCache;
use crate::hub::{Hub, RoleKey};
use crate::metrics::Metrics;
use crate::pipeline::PipelineExecutor;
use crate::process::{ProcessLauncher, ProcessSupervisor, SupervisorError};
use crate::self_healing::{CallContextTracker, Clearable, SelfHealingSupervisor};
use crate::store::StateStore;
use crate::textgen::{self, SpecialistHandler};

/// Roles that are backed by a text generator when one is configured.
const SPECIALISTS: [RoleKey; 6] = [
    RoleKey::Curator,
    RoleKey::Analyst,
    RoleKey::Storyteller,
    RoleKey::Synthesizer,
    RoleKey::Critic,
    RoleKey::Archivist,
];

pub struct JunctionContext {
    pub config: JunctionConfig,
    pub store: StateStore,
    pub metrics: Arc<Metrics>,
    pub tracker: Arc<CallContextTracker>,
    pub hub: Arc<Hub>,
    pub cache: Arc<ResultCache>,
    pub executor: Arc<PipelineExecutor>,
    pub alerts: Arc<dyn AlertSink>,
    shutdown: watch::Sender<bool>,
}

impl JunctionContext {
    /// Validate `config` and wire every component. Validation failure is
    /// the one error callers treat as fatal.
    pub fn new(config: JunctionConfig) -> Result<Self> {
        config.validate()?;
        let store = StateStore::open(&config.state_dir)?;
        let metrics = Arc::new(Metrics::new());
        let tracker = Arc::new(CallContextTracker::new());
        let hub = Arc::new(
            Hub::new(config.hub.clone(), Arc::clone(&metrics)).with_tracker(Arc::clone(&tracker)),
        );
        let cache = Arc::new(ResultCache::new());
        let executor = Arc::new(PipelineExecutor::new(
            &config,
            Arc::clone(&hub),
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&metrics),
            Some(Arc::clone(&cache)),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(state_dir = %store.root().display(), "junction context ready");
        Ok(Self {
            config,
            store,
            metrics,
            tracker,
            hub,
            cache,
            executor,
            alerts: Arc::new(TracingAlertSink),
            shutdown,
        })
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Register a command-backed handler for every specialist role the
    /// generator config covers. Returns how many roles were activated.
    pub async fn register_specialists(&self) -> usize {
        let mut registered = 0;
        for role in SPECIALISTS {
            let Some(generator) = textgen::from_config(&self.config.generator, role) else {
                continue;
            };
            if self
                .hub
                .register(role, Arc::new(SpecialistHandler::new(role, generator)))
                .await
            {
                registered += 1;
            }
        }
        registered
    }

    /// A self-healing supervisor that may clear the hub log and the
    /// fan-out cache, and broadcasts critical snapshots through the hub.
    pub fn health_supervisor(&self) -> SelfHealingSupervisor {
        SelfHealingSupervisor::new(
            self.config.health.clone(),
            self.store.clone(),
            Arc::clone(&self.tracker),
        )
        .with_cache(Arc::clone(&self.cache) as Arc<dyn Clearable>)
        .with_cache(Arc::clone(&self.hub) as Arc<dyn Clearable>)
        .with_hub(Arc::clone(&self.hub))
    }

    pub fn process_supervisor(
        &self,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> std::result::Result<ProcessSupervisor, SupervisorError> {
        ProcessSupervisor::new(
            self.config.supervisor.clone(),
            self.store.clone(),
            launcher,
            Arc::clone(&self.alerts),
            Arc::clone(&self.metrics),
        )
    }

    /// Run the health loop as a task that stops on [`Self::shutdown`].
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let supervisor = self.health_supervisor();
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every loop started from this context to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.metrics.flush();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JunctionError;

    fn config_in(dir: &std::path::Path) -> JunctionConfig {
        JunctionConfig {
            state_dir: dir.to_path_buf(),
            ..JunctionConfig::default()
        }
    }

    #[tokio::test]
    async fn builds_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = JunctionContext::new(config_in(dir.path())).unwrap();
        assert_eq!(ctx.store.root(), dir.path());
        // No generator command configured: nothing to register.
        assert_eq!(ctx.register_specialists().await, 0);
        assert!(ctx.hub.active_roles().await.is_empty());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.pipeline.meaning_roles.clear();
        let err = JunctionContext::new(config).err().unwrap();
        assert!(matches!(err, JunctionError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_health_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = JunctionContext::new(config_in(dir.path())).unwrap();
        let handle = ctx.spawn_health_monitor();
        ctx.shutdown();
        assert!(ctx.is_shutting_down());
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
