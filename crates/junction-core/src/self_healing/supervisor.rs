//! Periodic health assessment with bounded, safe auto-remediation.
//!
//! The only remediations applied are idempotent: creating missing required
//! directories and clearing registered in-memory caches. The supervisor
//! never restarts its own process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::HealthConfig;
use crate::domain::{JunctionError, Result};
use crate::hub::{Hub, MessageKind, RoleKey};
use crate::obs;
use crate::store::{read_json, write_json, StateStore};

use super::context_stack::CallContextTracker;
use super::filesystem::{disk_usage, ensure_dirs, DirStatus};
use super::memory::{MemoryLevel, MemoryMonitor, MemorySampler, ProcStatusSampler};
use super::Clearable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub component: String,
    pub severity: Severity,
    pub message: String,
}

impl HealthIssue {
    fn new(component: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub auto_fixes: Vec<String>,
    pub uptime_secs: u64,
    pub memory_mb: Option<u64>,
}

impl HealthSnapshot {
    /// The last persisted snapshot, if any.
    pub fn latest(store: &StateStore) -> Result<Option<Self>> {
        match read_json(&store.health_dir().join("latest.json")) {
            Ok(s) => Ok(Some(s)),
            Err(JunctionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The rolling log, oldest first.
    pub fn history(store: &StateStore) -> Result<Vec<Self>> {
        match read_json(&store.health_dir().join("log.json")) {
            Ok(log) => Ok(log),
            Err(JunctionError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn classify(issues: &[HealthIssue]) -> HealthStatus {
    match issues.iter().map(|i| i.severity).max() {
        None => HealthStatus::Healthy,
        Some(Severity::Warning) => HealthStatus::Degraded,
        Some(Severity::Critical) => HealthStatus::Critical,
    }
}

pub struct SelfHealingSupervisor {
    config: HealthConfig,
    store: StateStore,
    tracker: Arc<CallContextTracker>,
    sampler: Box<dyn MemorySampler>,
    monitor: Mutex<MemoryMonitor>,
    caches: Vec<Arc<dyn Clearable>>,
    hub: Option<Arc<Hub>>,
    started: Instant,
    cycles_seen: AtomicU64,
}

impl SelfHealingSupervisor {
    pub fn new(config: HealthConfig, store: StateStore, tracker: Arc<CallContextTracker>) -> Self {
        let monitor = MemoryMonitor::new(
            config.memory_baseline_mb,
            config.memory_threshold_mb,
            config.critical_multiplier,
            config.max_fixes_per_episode,
        );
        Self {
            config,
            store,
            tracker,
            sampler: Box::new(ProcStatusSampler),
            monitor: Mutex::new(monitor),
            caches: Vec::new(),
            hub: None,
            started: Instant::now(),
            cycles_seen: AtomicU64::new(0),
        }
    }

    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Register a cache the memory auto-fix may clear.
    pub fn with_cache(mut self, cache: Arc<dyn Clearable>) -> Self {
        self.caches.push(cache);
        self
    }

    /// Broadcast critical snapshots through `hub`.
    pub fn with_hub(mut self, hub: Arc<Hub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Run one assessment: sample, remediate, persist and (when critical)
    /// alert.
    pub async fn check(&self) -> Result<HealthSnapshot> {
        let mut issues = Vec::new();
        let mut auto_fixes = Vec::new();

        let memory_mb = self.check_memory(&mut issues, &mut auto_fixes);
        self.check_dirs(&mut issues, &mut auto_fixes);
        self.check_disk(&mut issues);
        self.check_cycles(&mut issues);

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            status: classify(&issues),
            issues,
            auto_fixes,
            uptime_secs: self.started.elapsed().as_secs(),
            memory_mb,
        };
        self.persist(&snapshot)?;
        obs::emit_health_snapshot(
            snapshot.status.as_str(),
            snapshot.issues.len(),
            snapshot.auto_fixes.len(),
        );

        if snapshot.status == HealthStatus::Critical {
            self.alert(&snapshot).await;
        }
        Ok(snapshot)
    }

    fn check_memory(&self, issues: &mut Vec<HealthIssue>, fixes: &mut Vec<String>) -> Option<u64> {
        let usage = self.sampler.sample_mb()?;
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        let reading = monitor.observe(usage);
        let severity = match reading.level {
            MemoryLevel::Normal => return Some(usage),
            MemoryLevel::Warning => Severity::Warning,
            MemoryLevel::Critical => Severity::Critical,
        };
        warn!(
            usage_mb = reading.usage_mb,
            baseline_mb = reading.baseline_mb,
            growth_mb = reading.growth_mb,
            "memory growth over threshold"
        );
        issues.push(HealthIssue::new(
            "memory",
            severity,
            format!(
                "{}MB in use, {}MB over the {}MB baseline",
                reading.usage_mb, reading.growth_mb, reading.baseline_mb
            ),
        ));

        if monitor.try_claim_fix() {
            for cache in &self.caches {
                let cleared = cache.clear_cache();
                info!(cache = cache.cache_name(), cleared, "cache cleared");
                fixes.push(format!("cleared {} ({} entries)", cache.cache_name(), cleared));
            }
        }
        Some(usage)
    }

    fn check_dirs(&self, issues: &mut Vec<HealthIssue>, fixes: &mut Vec<String>) {
        for (path, status) in ensure_dirs(&self.store, &self.config.required_dirs) {
            match status {
                DirStatus::Present => {}
                DirStatus::Created => fixes.push(format!("created {}", path.display())),
                DirStatus::Failed(reason) => issues.push(HealthIssue::new(
                    "filesystem",
                    Severity::Critical,
                    format!("cannot create {}: {reason}", path.display()),
                )),
            }
        }
    }

    fn check_disk(&self, issues: &mut Vec<HealthIssue>) {
        match disk_usage(&self.store, self.config.disk_warn_mb) {
            Ok(usage) if usage.over_threshold() => issues.push(HealthIssue::new(
                "disk",
                Severity::Warning,
                format!("state uses {}MB (warning at {}MB)", usage.used_mb, usage.warn_mb),
            )),
            Ok(_) => {}
            Err(e) => issues.push(HealthIssue::new(
                "disk",
                Severity::Warning,
                format!("cannot measure state usage: {e}"),
            )),
        }
    }

    fn check_cycles(&self, issues: &mut Vec<HealthIssue>) {
        let total = self.tracker.total_cycles();
        let previous = self.cycles_seen.swap(total, Ordering::SeqCst);
        if total > previous {
            let latest = self
                .tracker
                .recent_cycles(1)
                .into_iter()
                .next()
                .map(|c| c.chain)
                .unwrap_or_default();
            issues.push(HealthIssue::new(
                "call_context",
                Severity::Warning,
                format!("{} circular call(s) since last check, latest: {latest}", total - previous),
            ));
        }
    }

    fn persist(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let dir = self.store.health_dir();
        write_json(&dir.join("latest.json"), snapshot)?;

        let mut log = HealthSnapshot::history(&self.store).unwrap_or_else(|e| {
            warn!(error = %e, "health log unreadable, starting a new one");
            Vec::new()
        });
        log.push(snapshot.clone());
        if log.len() > self.config.log_capacity {
            let excess = log.len() - self.config.log_capacity;
            log.drain(..excess);
        }
        write_json(&dir.join("log.json"), &log)
    }

    async fn alert(&self, snapshot: &HealthSnapshot) {
        for issue in snapshot.issues.iter().filter(|i| i.severity == Severity::Critical) {
            error!(component = %issue.component, message = %issue.message, "critical health issue");
        }
        if let Some(hub) = &self.hub {
            hub.broadcast(
                RoleKey::Sentinel,
                MessageKind::Status,
                json!({ "alert": "health", "snapshot": snapshot }),
                &[],
            )
            .await;
        }
    }

    /// Check on a fixed cadence until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        warn!(error = %e, "health check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_worst_severity() {
        assert_eq!(classify(&[]), HealthStatus::Healthy);
        let w = HealthIssue::new("disk", Severity::Warning, "w");
        let c = HealthIssue::new("memory", Severity::Critical, "c");
        assert_eq!(classify(&[w.clone()]), HealthStatus::Degraded);
        assert_eq!(classify(&[w, c]), HealthStatus::Critical);
    }
}
