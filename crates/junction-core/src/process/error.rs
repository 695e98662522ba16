use crate::domain::JunctionError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {worker} has an empty command")]
    EmptyCommand { worker: String },

    #[error("worker name declared twice: {0}")]
    DuplicateWorker(String),

    #[error("worker {worker} depends on unknown worker {dependency}")]
    UnknownDependency { worker: String, dependency: String },

    #[error("worker dependencies form a cycle through: {0}")]
    DependencyCycle(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("failed to spawn worker {worker}: {reason}")]
    Spawn { worker: String, reason: String },

    #[error(transparent)]
    Domain(#[from] JunctionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
