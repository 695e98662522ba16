//! Required-directory and disk-usage checks.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::domain::Result;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirStatus {
    Present,
    /// Was missing and has been created.
    Created,
    /// Missing and could not be created.
    Failed(String),
}

/// Make sure every directory exists, creating the missing ones. Relative
/// paths resolve under the state directory.
pub fn ensure_dirs(store: &StateStore, dirs: &[PathBuf]) -> Vec<(PathBuf, DirStatus)> {
    dirs.iter()
        .map(|dir| {
            let path = store.resolve(dir);
            let status = ensure_dir(&path);
            (path, status)
        })
        .collect()
}

fn ensure_dir(path: &Path) -> DirStatus {
    if path.is_dir() {
        return DirStatus::Present;
    }
    match std::fs::create_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "created missing directory");
            DirStatus::Created
        }
        Err(e) => DirStatus::Failed(e.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_mb: u64,
    pub warn_mb: u64,
}

impl DiskUsage {
    pub fn over_threshold(&self) -> bool {
        self.used_mb > self.warn_mb
    }
}

pub fn disk_usage(store: &StateStore, warn_mb: u64) -> Result<DiskUsage> {
    Ok(DiskUsage {
        used_mb: store.disk_usage()? / (1024 * 1024),
        warn_mb,
    })
}
