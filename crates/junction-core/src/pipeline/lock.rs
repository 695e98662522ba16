//! Per-signal mutual exclusion.
//!
//! The lock is advisory and non-queueing: a second acquisition for an
//! in-flight signal fails immediately. Holders are tracked in memory for
//! this process and as `locks/<signal>.json` records for other processes.
//! A record past its `expires_at` is treated as abandoned and may be taken
//! over.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::domain::JunctionError;
use crate::store::{read_json, write_atomic};

use super::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub signal_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct LockTable {
    dir: PathBuf,
    ttl: Duration,
    /// signal id -> holder, for locks held by this process.
    held: Mutex<HashMap<String, String>>,
}

impl LockTable {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, signal_id: &str) -> PathBuf {
        self.dir.join(format!("{signal_id}.json"))
    }

    /// Take the lock for `signal_id` on behalf of `holder` (a run id).
    pub fn acquire(self: &Arc<Self>, signal_id: &str, holder: &str) -> PipelineResult<LockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = held.get(signal_id) {
            return Err(PipelineError::DuplicateInFlight {
                signal_id: signal_id.to_string(),
                holder: current.clone(),
            });
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let record = LockRecord {
            signal_id: signal_id.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        self.persist(&record, now)?;

        held.insert(signal_id.to_string(), holder.to_string());
        debug!(signal_id, holder, "lock acquired");
        Ok(LockGuard {
            table: Arc::clone(self),
            signal_id: signal_id.to_string(),
            holder: holder.to_string(),
        })
    }

    fn persist(&self, record: &LockRecord, now: DateTime<Utc>) -> PipelineResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(JunctionError::from)?;
        let path = self.path(&record.signal_id);
        let json = serde_json::to_vec_pretty(record).map_err(JunctionError::from)?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(JunctionError::from)?;
        tmp.write_all(&json).map_err(JunctionError::from)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(JunctionError::from(e.error).into()),
        }

        match read_json::<LockRecord>(&path) {
            Ok(existing) if !existing.is_expired(now) => Err(PipelineError::DuplicateInFlight {
                signal_id: record.signal_id.clone(),
                holder: existing.holder,
            }),
            Ok(existing) => {
                warn!(
                    signal_id = %record.signal_id,
                    stale_holder = %existing.holder,
                    expired_at = %existing.expires_at,
                    "taking over expired lock"
                );
                write_atomic(&path, &json)?;
                Ok(())
            }
            Err(e) => {
                warn!(signal_id = %record.signal_id, error = %e, "replacing unreadable lock record");
                write_atomic(&path, &json)?;
                Ok(())
            }
        }
    }

    fn release(&self, signal_id: &str, holder: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(signal_id).map(String::as_str) == Some(holder) {
            held.remove(signal_id);
        }

        let path = self.path(signal_id);
        match read_json::<LockRecord>(&path) {
            Ok(record) if record.holder == holder => {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(signal_id, error = %e, "failed to remove lock record");
                }
            }
            Ok(record) => debug!(signal_id, holder = %record.holder, "lock record now owned elsewhere"),
            Err(_) => {}
        }
        debug!(signal_id, holder, "lock released");
    }

    /// Whether this process holds the lock for `signal_id`.
    pub fn is_held(&self, signal_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(signal_id)
    }

    /// The persisted record, if any.
    pub fn record(&self, signal_id: &str) -> Option<LockRecord> {
        read_json(&self.path(signal_id)).ok()
    }
}

/// Releases its lock when dropped, on every exit path.
pub struct LockGuard {
    table: Arc<LockTable>,
    signal_id: String,
    holder: String,
}

impl LockGuard {
    pub fn signal_id(&self) -> &str {
        &self.signal_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.signal_id, &self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_json;

    fn table(dir: &std::path::Path) -> Arc<LockTable> {
        Arc::new(LockTable::new(dir.join("locks"), Duration::from_secs(60)))
    }

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let locks = table(dir.path());
        let guard = locks.acquire("s1", "run-a").unwrap();
        match locks.acquire("s1", "run-b") {
            Err(PipelineError::DuplicateInFlight { holder, .. }) => assert_eq!(holder, "run-a"),
            other => panic!("expected DuplicateInFlight, got {:?}", other.map(|_| ())),
        }
        assert_eq!(guard.holder(), "run-a");
        assert_eq!(locks.record("s1").unwrap().holder, "run-a");
    }

    #[test]
    fn drop_releases_memory_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let locks = table(dir.path());
        {
            let _g = locks.acquire("s1", "run-a").unwrap();
            assert!(locks.is_held("s1"));
        }
        assert!(!locks.is_held("s1"));
        assert!(locks.record("s1").is_none());
        assert!(locks.acquire("s1", "run-b").is_ok());
    }

    #[test]
    fn foreign_live_record_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let locks = table(dir.path());
        let now = Utc::now();
        write_json(
            &dir.path().join("locks/s1.json"),
            &LockRecord {
                signal_id: "s1".into(),
                holder: "other-process".into(),
                acquired_at: now,
                expires_at: now + chrono::Duration::minutes(5),
            },
        )
        .unwrap();
        assert!(matches!(
            locks.acquire("s1", "run-a"),
            Err(PipelineError::DuplicateInFlight { .. })
        ));
    }

    #[test]
    fn expired_record_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let locks = table(dir.path());
        let past = Utc::now() - chrono::Duration::hours(1);
        write_json(
            &dir.path().join("locks/s1.json"),
            &LockRecord {
                signal_id: "s1".into(),
                holder: "crashed".into(),
                acquired_at: past,
                expires_at: past + chrono::Duration::minutes(15),
            },
        )
        .unwrap();
        let _g = locks.acquire("s1", "run-a").unwrap();
        assert_eq!(locks.record("s1").unwrap().holder, "run-a");
    }
}
