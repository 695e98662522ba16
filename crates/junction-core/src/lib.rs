//! Junction core library
//!
//! Signal pipeline, role hub, quality gate and self-supervision. Build one
//! [`JunctionContext`] at process start and hand it to every component.

pub mod alert;
pub mod channel;
pub mod config;
pub mod context;
pub mod domain;
pub mod fanout;
pub mod hub;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod process;
pub mod quality_gate;
pub mod self_healing;
pub mod store;
pub mod telemetry;
pub mod textgen;

pub use alert::{AlertSink, IncidentRecord, OperatorAlert, RecordingAlertSink, TracingAlertSink};
pub use channel::{parse_command, ChannelCommand, ChannelSession, OutboundRateLimiter};
pub use config::JunctionConfig;
pub use context::JunctionContext;
pub use domain::{ContentDigest, JunctionError, Result, Signal, SignalInput};
pub use fanout::{
    CallError, Dispatch, FanOutExecutor, FanOutResults, FanOutTarget, ResultCache,
};
pub use hub::{
    handler_fn, Hub, HubError, HubResult, Message, MessageKind, RoleHandler, RoleKey, Session,
    SessionKind, SessionResult, SessionStatus,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{PipelineError, PipelineExecutor, PipelineRun, RunStatus};
pub use process::{ProcessSupervisor, SupervisorError, WorkerSpec};
pub use quality_gate::{ArtifactType, Decision, QualityGate, QualityJudgment};
pub use self_healing::{CallContextTracker, HealthSnapshot, HealthStatus, SelfHealingSupervisor};
pub use store::StateStore;
pub use telemetry::{init_tracing, LogFormat};
pub use textgen::{CommandGenerator, TextGenerator};

/// Junction version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
