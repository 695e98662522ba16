//! Configuration for every junction component, loaded from TOML.
//!
//! Every field has a default so an empty file (or no file) yields a working
//! configuration. [`JunctionConfig::validate`] is the gate for fatal
//! misconfiguration; callers abort process start when it fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{JunctionError, Result};
use crate::hub::RoleKey;
use crate::process::spec::{launch_order, WorkerSpec};
use crate::quality_gate::ArtifactType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JunctionConfig {
    /// Root of all persisted state (signals, runs, logs, locks).
    pub state_dir: PathBuf,
    pub hub: HubConfig,
    pub pipeline: PipelineConfig,
    pub quality: QualityConfig,
    pub health: HealthConfig,
    pub supervisor: SupervisorConfig,
    pub generator: GeneratorConfig,
}

impl Default for JunctionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".junction"),
            hub: HubConfig::default(),
            pipeline: PipelineConfig::default(),
            quality: QualityConfig::default(),
            health: HealthConfig::default(),
            supervisor: SupervisorConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl JunctionConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Reject configurations the process must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.meaning_roles.is_empty() {
            return Err(JunctionError::InvalidConfig(
                "pipeline.meaning_roles must name at least one role".into(),
            ));
        }
        if self.pipeline.meaning_roles.contains(&RoleKey::Synthesizer) {
            return Err(JunctionError::InvalidConfig(
                "the synthesizer cannot also be a meaning role".into(),
            ));
        }
        if self.quality.pass_threshold > 100 || self.quality.revise_floor > self.quality.pass_threshold
        {
            return Err(JunctionError::InvalidConfig(format!(
                "quality thresholds must satisfy revise_floor <= pass_threshold <= 100 (got {} / {})",
                self.quality.revise_floor, self.quality.pass_threshold
            )));
        }
        if self.pipeline.top_k == 0 {
            return Err(JunctionError::InvalidConfig("pipeline.top_k must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.pipeline.min_overlap) {
            return Err(JunctionError::InvalidConfig(
                "pipeline.min_overlap must be within 0..=1".into(),
            ));
        }
        if self.health.interval_secs == 0 || self.supervisor.poll_interval_ms == 0 {
            return Err(JunctionError::InvalidConfig(
                "monitor intervals must be non-zero".into(),
            ));
        }
        launch_order(&self.supervisor.workers)
            .map_err(|e| JunctionError::InvalidConfig(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of the rolling message log.
    pub message_log_capacity: usize,
    pub request_timeout_ms: u64,
    /// Finalized sessions kept for lookup; the oldest are evicted first.
    pub session_retention: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            message_log_capacity: 512,
            request_timeout_ms: 30_000,
            session_retention: 256,
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Backoff retry for transient specialist failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many prior signals Connect scans for overlap.
    pub history_window: usize,
    pub top_k: usize,
    /// Minimum Jaccard overlap for a prior signal to count as a connection.
    pub min_overlap: f64,
    pub call_timeout_ms: u64,
    /// Resubmissions allowed after a "revise" judgment.
    pub max_revisions: u32,
    pub lock_ttl_secs: u64,
    pub meaning_roles: Vec<RoleKey>,
    pub artifact_type: ArtifactType,
    pub retry: RetryPolicy,
    pub use_cache: bool,
    /// Cached fan-out results older than this are treated as stale.
    pub cache_horizon_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window: 50,
            top_k: 5,
            min_overlap: 0.1,
            call_timeout_ms: 60_000,
            max_revisions: 1,
            lock_ttl_secs: 900,
            meaning_roles: vec![RoleKey::Analyst, RoleKey::Storyteller],
            artifact_type: ArtifactType::Article,
            retry: RetryPolicy::default(),
            use_cache: true,
            cache_horizon_secs: 3_600,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn cache_horizon(&self) -> Duration {
        Duration::from_secs(self.cache_horizon_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub pass_threshold: u32,
    pub revise_floor: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 70,
            revise_floor: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Growth over the baseline that raises a leak warning.
    pub memory_threshold_mb: u64,
    /// Growth of `threshold * multiplier` is classified critical.
    pub critical_multiplier: f64,
    /// Fixed baseline; when absent the first sample becomes the baseline.
    pub memory_baseline_mb: Option<u64>,
    /// Directories (relative to the state dir unless absolute) that must exist.
    pub required_dirs: Vec<PathBuf>,
    pub disk_warn_mb: u64,
    pub log_capacity: usize,
    /// Cache-clearing fixes allowed per leak episode.
    pub max_fixes_per_episode: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            memory_threshold_mb: 500,
            critical_multiplier: 2.0,
            memory_baseline_mb: None,
            required_dirs: ["signals", "published", "runs", "locks", "health", "incidents"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            disk_warn_mb: 1_024,
            log_capacity: 100,
            max_fixes_per_episode: 1,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    /// Pause between consecutive worker launches.
    pub start_spacing_ms: u64,
    /// Grace period between SIGTERM and a forced kill.
    pub stop_timeout_ms: u64,
    pub workers: Vec<WorkerSpec>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            start_spacing_ms: 500,
            stop_timeout_ms: 10_000,
            workers: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_spacing(&self) -> Duration {
        Duration::from_millis(self.start_spacing_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// External text-generation commands. The prompt is written to stdin and
/// the completion read from stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: Vec<String>,
    pub fallback_command: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            fallback_command: Vec::new(),
            timeout_ms: 120_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = JunctionConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, JunctionConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = JunctionConfig::from_toml_str(
            r#"
            state_dir = "/var/lib/junction"

            [pipeline]
            max_revisions = 2
            meaning_roles = ["analyst"]

            [[supervisor.workers]]
            name = "bot"
            command = ["python3", "bot.py"]
            critical = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/junction"));
        assert_eq!(cfg.pipeline.max_revisions, 2);
        assert_eq!(cfg.pipeline.meaning_roles, vec![RoleKey::Analyst]);
        assert_eq!(cfg.pipeline.top_k, 5);
        assert_eq!(cfg.supervisor.workers.len(), 1);
        assert!(cfg.supervisor.workers[0].critical);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_meaning_roles() {
        let mut cfg = JunctionConfig::default();
        cfg.pipeline.meaning_roles.clear();
        assert!(matches!(
            cfg.validate(),
            Err(JunctionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut cfg = JunctionConfig::default();
        cfg.quality.revise_floor = 80;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = JunctionConfig::from_toml_str("state_dir = [").unwrap_err();
        assert!(matches!(err, JunctionError::ConfigParse(_)));
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }
}
