//! Operator alerts and persisted incident records.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::Result;
use crate::store::{write_json, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub timestamp: DateTime<Utc>,
    /// Subsystem that raised the alert, e.g. `"worker:bot"`.
    pub source: String,
    pub summary: String,
    pub detail: String,
}

impl OperatorAlert {
    pub fn new(source: impl Into<String>, summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

/// Where operator alerts go. Delivery failures stay inside the sink.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &OperatorAlert);
}

/// Logs alerts at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &OperatorAlert) {
        error!(
            event = "operator.alert",
            source = %alert.source,
            summary = %alert.summary,
            detail = %alert.detail,
        );
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, alert: &OperatorAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub opened_at: DateTime<Utc>,
    pub worker: String,
    pub restarts: u32,
    pub max_restarts: u32,
    pub last_error: Option<String>,
    pub alert: OperatorAlert,
}

/// Persist `incident` as one JSON object under `incidents/`.
pub fn write_incident(store: &StateStore, incident: &IncidentRecord) -> Result<PathBuf> {
    let path = store.incidents_dir().join(format!("{}.json", incident.id));
    write_json(&path, incident)?;
    Ok(path)
}

/// Every persisted incident, oldest first.
pub fn list_incidents(store: &StateStore) -> Result<Vec<IncidentRecord>> {
    let dir = store.incidents_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out: Vec<IncidentRecord> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(crate::store::read_json(&path)?);
        }
    }
    out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
    Ok(out)
}
