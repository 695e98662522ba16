//! Pipeline run records. One per signal submission, persisted under
//! `runs/<run_id>.json` once the run reaches a terminal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ContentDigest;
use crate::hub::RoleKey;
use crate::quality_gate::{ArtifactType, Decision, QualityJudgment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Capture,
    Connect,
    Meaning,
    Manifest,
    Cycle,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Capture => "capture",
            Phase::Connect => "connect",
            Phase::Meaning => "meaning",
            Phase::Manifest => "manifest",
            Phase::Cycle => "cycle",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Published,
    Rejected,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Published => "published",
            RunStatus::Rejected => "rejected",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Potential {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub signal_id: String,
    /// Jaccard overlap of the two keyword sets.
    pub overlap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Curator score 0–100; absent when the curator was unavailable.
    pub score: Option<u32>,
    pub connections: Vec<Connection>,
    pub potential: Potential,
    pub history_scanned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeaningResult {
    pub perspectives: BTreeMap<RoleKey, String>,
    pub failures: BTreeMap<RoleKey, String>,
    pub draft: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestResult {
    /// One judgment per evaluation, in order. Revisions append, never replace.
    pub judgments: Vec<QualityJudgment>,
    pub revisions: u32,
    pub decision: Decision,
    /// The artifact the final judgment was made on.
    pub artifact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResult {
    pub published_path: String,
    pub published_at: DateTime<Utc>,
}

/// Metadata written next to a published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub signal_id: String,
    pub run_id: String,
    pub origin: String,
    pub published_at: DateTime<Utc>,
    pub artifact_type: ArtifactType,
    pub score: u32,
    pub revisions: u32,
    pub potential: Option<Potential>,
    pub connections: Vec<String>,
    pub artifact_digest: ContentDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub signal_id: String,
    /// Current phase, or the phase the run ended in.
    pub phase: Phase,
    pub status: RunStatus,
    pub connect: Option<ConnectResult>,
    pub meaning: Option<MeaningResult>,
    pub manifest: Option<ManifestResult>,
    pub cycle: Option<CycleResult>,
    /// Why the run was rejected or failed.
    pub reason: Option<String>,
    pub timings: Vec<PhaseTiming>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(signal_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            phase: Phase::Capture,
            status: RunStatus::Running,
            connect: None,
            meaning: None,
            manifest: None,
            cycle: None,
            reason: None,
            timings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn finish(&mut self, status: RunStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
