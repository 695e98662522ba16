//! Structured lifecycle events for pipeline runs, the quality gate and the
//! supervisors.
//!
//! Every emitter logs one event with a stable `event = "..."` field so log
//! pipelines can filter on it regardless of the message text.

use tracing::{info, warn};

/// Span carrying `run_id` and `signal_id` for everything a run logs.
/// Attach it with `tracing::Instrument` so it survives `.await` points.
pub fn run_span(run_id: &str, signal_id: &str) -> tracing::Span {
    tracing::info_span!("junction.run", run_id = %run_id, signal_id = %signal_id)
}

pub fn emit_run_started(run_id: &str, signal_id: &str, origin: &str) {
    info!(event = "run.started", run_id = %run_id, signal_id = %signal_id, origin = %origin);
}

pub fn emit_stage_completed(run_id: &str, phase: &str, duration_ms: u64) {
    info!(event = "run.stage_completed", run_id = %run_id, phase = %phase, duration_ms = duration_ms);
}

pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(event = "run.finished", run_id = %run_id, status = %status, duration_ms = duration_ms);
}

pub fn emit_duplicate_rejected(signal_id: &str, holder: &str) {
    warn!(event = "run.duplicate_rejected", signal_id = %signal_id, holder = %holder);
}

pub fn emit_gate_evaluated(artifact: &str, score: u32, decision: &str) {
    info!(event = "gate.evaluated", artifact = %artifact, score = score, decision = %decision);
}

pub fn emit_health_snapshot(status: &str, issues: usize, auto_fixes: usize) {
    info!(event = "health.snapshot", status = %status, issues = issues, auto_fixes = auto_fixes);
}

pub fn emit_worker_restarted(worker: &str, restarts: u32, max_restarts: u32) {
    warn!(
        event = "worker.restarted",
        worker = %worker,
        restarts = restarts,
        max_restarts = max_restarts,
    );
}
