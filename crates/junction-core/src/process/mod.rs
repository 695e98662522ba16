//! Process supervisor: launches long-running workers in dependency order,
//! polls their liveness and health, restarts them under a per-worker cap
//! and escalates exhaustion of critical workers to the operator.

pub mod error;
pub mod launcher;
pub mod spec;
pub mod supervisor;

pub use error::SupervisorError;
pub use launcher::{pid_alive, terminate_pid, ExitInfo, ProcessLauncher, TokioLauncher, WorkerHandle};
pub use spec::{launch_order, HealthProbe, WorkerSpec};
pub use supervisor::{
    pid_file, read_pid_file, remove_pid_file, request_restart, write_pid_file, ProcessSupervisor,
    SupervisorStatus, WorkerState, WorkerStatus,
};
