//! Process memory sampling and leak classification.

use serde::{Deserialize, Serialize};

/// Source of resident-memory samples, in MB.
pub trait MemorySampler: Send + Sync {
    /// `None` when the platform offers no reading.
    fn sample_mb(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatusSampler;

#[cfg(target_os = "linux")]
impl MemorySampler for ProcStatusSampler {
    fn sample_mb(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb / 1024)
    }
}

#[cfg(not(target_os = "linux"))]
impl MemorySampler for ProcStatusSampler {
    fn sample_mb(&self) -> Option<u64> {
        None
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub usage_mb: u64,
    pub baseline_mb: u64,
    pub growth_mb: u64,
    pub level: MemoryLevel,
}

/// Tracks growth over a baseline and rations auto-fixes per episode. An
/// episode starts when growth first exceeds the threshold and ends when a
/// sample falls back under it.
#[derive(Debug, Clone)]
pub struct MemoryMonitor {
    baseline_mb: Option<u64>,
    threshold_mb: u64,
    critical_multiplier: f64,
    max_fixes_per_episode: u32,
    fixes_this_episode: u32,
    in_episode: bool,
}

impl MemoryMonitor {
    pub fn new(
        baseline_mb: Option<u64>,
        threshold_mb: u64,
        critical_multiplier: f64,
        max_fixes_per_episode: u32,
    ) -> Self {
        Self {
            baseline_mb,
            threshold_mb,
            critical_multiplier,
            max_fixes_per_episode,
            fixes_this_episode: 0,
            in_episode: false,
        }
    }

    pub fn baseline_mb(&self) -> Option<u64> {
        self.baseline_mb
    }

    /// Classify one sample. The first sample becomes the baseline when none
    /// was configured.
    pub fn observe(&mut self, usage_mb: u64) -> MemoryReading {
        let baseline_mb = *self.baseline_mb.get_or_insert(usage_mb);
        let growth_mb = usage_mb.saturating_sub(baseline_mb);
        let critical_mb = (self.threshold_mb as f64 * self.critical_multiplier) as u64;

        let level = if growth_mb > critical_mb {
            MemoryLevel::Critical
        } else if growth_mb > self.threshold_mb {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        };

        if level == MemoryLevel::Normal {
            self.in_episode = false;
            self.fixes_this_episode = 0;
        } else {
            self.in_episode = true;
        }

        MemoryReading {
            usage_mb,
            baseline_mb,
            growth_mb,
            level,
        }
    }

    pub fn in_episode(&self) -> bool {
        self.in_episode
    }

    /// Claim one auto-fix for the current episode.
    pub fn try_claim_fix(&mut self) -> bool {
        if !self.in_episode || self.fixes_this_episode >= self.max_fixes_per_episode {
            return false;
        }
        self.fixes_this_episode += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tjunction\nVmPeak:\t  900 kB\nVmRSS:\t  204800 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(204_800));
        assert_eq!(parse_vm_rss_kb("Name: x\n"), None);
    }

    #[test]
    fn first_sample_becomes_baseline() {
        let mut m = MemoryMonitor::new(None, 500, 2.0, 1);
        let r = m.observe(120);
        assert_eq!(r.baseline_mb, 120);
        assert_eq!(r.level, MemoryLevel::Normal);
        assert_eq!(m.observe(700).level, MemoryLevel::Warning);
    }

    #[test]
    fn critical_beyond_multiplier() {
        let mut m = MemoryMonitor::new(Some(0), 500, 2.0, 1);
        assert_eq!(m.observe(500).level, MemoryLevel::Normal);
        assert_eq!(m.observe(600).level, MemoryLevel::Warning);
        assert_eq!(m.observe(1_001).level, MemoryLevel::Critical);
    }

    #[test]
    fn fixes_are_rationed_per_episode() {
        let mut m = MemoryMonitor::new(Some(0), 500, 2.0, 1);
        assert!(!m.try_claim_fix());
        m.observe(600);
        assert!(m.try_claim_fix());
        m.observe(650);
        assert!(!m.try_claim_fix());
        m.observe(100);
        assert!(!m.in_episode());
        m.observe(600);
        assert!(m.try_claim_fix());
    }
}
