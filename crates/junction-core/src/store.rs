//! On-disk layout of junction state.
//!
//! ```text
//! <state_dir>/
//!   signals/<id>.json        signal metadata
//!   signals/<id>.raw         raw payload, byte-for-byte
//!   published/<id>.md        published artifact
//!   published/<id>.json      publication metadata
//!   runs/<run_id>.json       pipeline run records
//!   locks/<id>.json          per-signal lock records
//!   health/latest.json       last health snapshot
//!   health/log.json          bounded rolling health log
//!   incidents/<ts>-<w>.json  operator incidents
//!   supervisor/              process supervisor status, pid and control files
//!   validation.jsonl         append-only quality gate log
//! ```
//!
//! Every update is a single whole-object write through a temp file and an
//! atomic rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::{ContentDigest, JunctionError, Result, Signal};

/// Outcome of persisting a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    /// Newly written.
    Stored(Signal),
    /// Already archived with identical bytes; the archived record is reused.
    Existing(Signal),
}

impl Captured {
    pub fn signal(&self) -> &Signal {
        match self {
            Captured::Stored(s) | Captured::Existing(s) => s,
        }
    }

    pub fn into_signal(self) -> Signal {
        match self {
            Captured::Stored(s) | Captured::Existing(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the state directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn published_dir(&self) -> PathBuf {
        self.root.join("published")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.root.join("health")
    }

    pub fn incidents_dir(&self) -> PathBuf {
        self.root.join("incidents")
    }

    pub fn supervisor_dir(&self) -> PathBuf {
        self.root.join("supervisor")
    }

    pub fn validation_log_path(&self) -> PathBuf {
        self.root.join("validation.jsonl")
    }

    /// Resolve a configured directory: absolute paths are kept, relative
    /// ones live under the state directory.
    pub fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }

    /// Persist a freshly captured signal. Capturing an id that is already
    /// archived reuses the archived record when the payload matches and
    /// fails with [`JunctionError::DigestMismatch`] otherwise.
    pub fn save_signal(&self, signal: &Signal) -> Result<Captured> {
        let meta = self.signals_dir().join(format!("{}.json", signal.id));
        if meta.exists() {
            let existing = self.load_signal(&signal.id)?;
            if existing.payload_digest != signal.payload_digest {
                return Err(JunctionError::DigestMismatch {
                    expected: existing.payload_digest.to_string(),
                    actual: signal.payload_digest.to_string(),
                });
            }
            debug!(signal_id = %signal.id, "signal already archived");
            return Ok(Captured::Existing(existing));
        }

        // Blob first: a metadata record never points at a missing payload.
        write_atomic(&self.signals_dir().join(format!("{}.raw", signal.id)), &signal.payload)?;
        write_json(&meta, signal)?;
        Ok(Captured::Stored(signal.clone()))
    }

    /// Load a signal with its payload, verifying the payload digest.
    pub fn load_signal(&self, id: &str) -> Result<Signal> {
        let mut signal: Signal = read_json(&self.signals_dir().join(format!("{id}.json")))?;
        let raw_path = self.signals_dir().join(format!("{id}.raw"));
        let payload = fs::read(&raw_path).map_err(|e| not_found(e, &raw_path))?;
        let actual = ContentDigest::from_bytes(&payload);
        if actual != signal.payload_digest {
            return Err(JunctionError::DigestMismatch {
                expected: signal.payload_digest.to_string(),
                actual: actual.to_string(),
            });
        }
        signal.payload = payload;
        Ok(signal)
    }

    /// The most recent `limit` archived signals, newest first, excluding
    /// `exclude`. Unreadable records are skipped.
    pub fn recent_signals(&self, limit: usize, exclude: &str) -> Result<Vec<Signal>> {
        let dir = self.signals_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut metas: Vec<Signal> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Signal>(&path) {
                Ok(s) if s.id != exclude => metas.push(s),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable signal"),
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        metas.truncate(limit);

        Ok(metas
            .into_iter()
            .filter_map(|m| self.load_signal(&m.id).ok())
            .collect())
    }

    /// Write the published artifact and its metadata record.
    pub fn publish<T: Serialize>(&self, signal_id: &str, markdown: &str, record: &T) -> Result<PathBuf> {
        let dir = self.published_dir();
        let path = dir.join(format!("{signal_id}.md"));
        write_atomic(&path, markdown.as_bytes())?;
        write_json(&dir.join(format!("{signal_id}.json")), record)?;
        Ok(path)
    }

    pub fn is_published(&self, signal_id: &str) -> bool {
        self.published_dir().join(format!("{signal_id}.md")).exists()
    }

    pub fn save_run<T: Serialize>(&self, run_id: &str, run: &T) -> Result<()> {
        write_json(&self.runs_dir().join(format!("{run_id}.json")), run)
    }

    pub fn load_run<T: DeserializeOwned>(&self, run_id: &str) -> Result<T> {
        read_json(&self.runs_dir().join(format!("{run_id}.json")))
    }

    /// Total bytes of regular files under the state directory.
    pub fn disk_usage(&self) -> Result<u64> {
        dir_size(&self.root)
    }
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn not_found(e: std::io::Error, path: &Path) -> JunctionError {
    if e.kind() == std::io::ErrorKind::NotFound {
        JunctionError::NotFound(path.display().to_string())
    } else {
        JunctionError::Io(e)
    }
}

/// Write `data` to `path` through a temp file in the same directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Read a JSON object; a missing file is [`JunctionError::NotFound`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).map_err(|e| not_found(e, path))?;
    Ok(serde_json::from_slice(&raw)?)
}
