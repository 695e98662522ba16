//! Error types for pipeline runs.

use crate::domain::JunctionError;
use crate::hub::HubError;

use super::run::Phase;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Another run holds the signal's lock. Rejected, never queued.
    #[error("signal {signal_id} is already in flight (held by {holder})")]
    DuplicateInFlight { signal_id: String, holder: String },

    #[error("no specialist produced a perspective: {detail}")]
    NoPerspectives { detail: String },

    #[error("{phase} stage failed: {reason}")]
    Stage { phase: Phase, reason: String },

    #[error("circular call context: {chain}")]
    CircularContext { chain: String },

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Domain(#[from] JunctionError),
}

impl PipelineError {
    pub fn stage(phase: Phase, reason: impl Into<String>) -> Self {
        PipelineError::Stage {
            phase,
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
