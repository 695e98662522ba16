//! The per-signal pipeline: Capture → Connect → Meaning → Manifest → Cycle.
//!
//! # Module layout
//!
//! - [`lock`]: per-signal advisory lock with persisted, expiring records
//! - [`run`]: `PipelineRun` record and per-phase results
//! - [`connect`]: lexical overlap and content-potential classification
//! - [`executor`]: `PipelineExecutor`, the stage state machine
//! - [`error`]: `PipelineError`, `PipelineResult`

pub mod connect;
pub mod error;
pub mod executor;
pub mod lock;
pub mod run;

pub use connect::{classify_potential, find_connections, jaccard, parse_score};
pub use error::{PipelineError, PipelineResult};
pub use executor::{ManifestStep, PipelineExecutor, RevisionPolicy};
pub use lock::{LockGuard, LockRecord, LockTable};
pub use run::{
    Connection, ConnectResult, CycleResult, ManifestResult, MeaningResult, Phase, PhaseTiming,
    PipelineRun, Potential, PublicationRecord, RunStatus,
};
