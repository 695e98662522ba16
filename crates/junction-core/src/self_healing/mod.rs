//! Self-monitoring: circular call detection, memory growth, required
//! directories and disk usage, folded into periodic health snapshots with
//! bounded auto-remediation.

pub mod context_stack;
pub mod filesystem;
pub mod memory;
pub mod supervisor;

pub use context_stack::{CallContextTracker, ContextGuard, CycleRecord};
pub use memory::{MemoryLevel, MemoryMonitor, MemoryReading, MemorySampler, ProcStatusSampler};
pub use supervisor::{
    HealthIssue, HealthSnapshot, HealthStatus, SelfHealingSupervisor, Severity,
};

/// An in-memory cache the supervisor may empty to relieve memory pressure.
/// Clearing must be safe at any time and idempotent.
pub trait Clearable: Send + Sync {
    fn cache_name(&self) -> &'static str;

    /// Drop every entry; returns how many were removed.
    fn clear_cache(&self) -> usize;
}
