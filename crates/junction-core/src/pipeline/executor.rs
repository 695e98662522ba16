//! The pipeline state machine.
//!
//! A run holds its signal's lock from before Capture until the run record is
//! persisted. The lock guard is released on drop, so every exit path (a
//! publication, a rejection, a stage error) frees the signal again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn, Instrument};

use crate::config::{JunctionConfig, PipelineConfig};
use crate::domain::{Signal, SignalInput};
use crate::fanout::{FanOutExecutor, FanOutTarget, ResultCache};
use crate::hub::session::reply_text;
use crate::hub::{Hub, MessageKind, RoleKey};
use crate::metrics::Metrics;
use crate::obs::{
    emit_duplicate_rejected, emit_gate_evaluated, emit_run_finished, emit_run_started,
    emit_stage_completed, run_span,
};
use crate::quality_gate::{Decision, QualityGate, QualityJudgment, ValidationLog, ValidationRecord};
use crate::self_healing::{CallContextTracker, ContextGuard};
use crate::store::StateStore;

use super::connect::{classify_potential, find_connections, parse_score};
use super::error::{PipelineError, PipelineResult};
use super::lock::LockTable;
use super::run::{
    ConnectResult, CycleResult, ManifestResult, MeaningResult, Phase, PhaseTiming, PipelineRun,
    PublicationRecord, RunStatus,
};

/// What Manifest does after a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStep {
    Publish,
    Revise,
    Archive,
}

/// The single place the revise cap is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionPolicy {
    pub max_revisions: u32,
}

impl RevisionPolicy {
    pub fn new(max_revisions: u32) -> Self {
        Self { max_revisions }
    }

    pub fn next_step(&self, decision: Decision, revisions_used: u32) -> ManifestStep {
        match decision {
            Decision::Pass => ManifestStep::Publish,
            Decision::Archive => ManifestStep::Archive,
            Decision::Revise if revisions_used < self.max_revisions => ManifestStep::Revise,
            Decision::Revise => ManifestStep::Archive,
        }
    }
}

impl Default for RevisionPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

pub struct PipelineExecutor {
    config: PipelineConfig,
    hub: Arc<Hub>,
    store: StateStore,
    gate: QualityGate,
    validation: ValidationLog,
    locks: Arc<LockTable>,
    fanout: FanOutExecutor,
    tracker: Arc<CallContextTracker>,
    metrics: Arc<Metrics>,
    revisions: RevisionPolicy,
}

impl PipelineExecutor {
    pub fn new(
        config: &JunctionConfig,
        hub: Arc<Hub>,
        store: StateStore,
        tracker: Arc<CallContextTracker>,
        metrics: Arc<Metrics>,
        cache: Option<Arc<ResultCache>>,
    ) -> Self {
        let pipeline = config.pipeline.clone();
        let mut fanout = FanOutExecutor::new(hub.clone(), Arc::clone(&metrics))
            .with_retry(pipeline.retry.clone());
        if let Some(cache) = cache.filter(|_| pipeline.use_cache) {
            fanout = fanout.with_cache(cache, pipeline.cache_horizon());
        }
        Self {
            locks: Arc::new(LockTable::new(store.locks_dir(), pipeline.lock_ttl())),
            validation: ValidationLog::new(store.validation_log_path()),
            gate: QualityGate::new(config.quality.clone()),
            revisions: RevisionPolicy::new(pipeline.max_revisions),
            config: pipeline,
            hub,
            store,
            fanout,
            tracker,
            metrics,
        }
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn revision_policy(&self) -> RevisionPolicy {
        self.revisions
    }

    /// Run one signal through every stage.
    ///
    /// Returns `Err` only when the run never started: an invalid id or a
    /// duplicate of a signal already in flight. Stage failures end the run
    /// in [`RunStatus::Error`] and are reported through the returned record.
    pub async fn submit(&self, input: SignalInput) -> PipelineResult<PipelineRun> {
        let signal_id = input.resolve_id()?;
        let mut run = PipelineRun::new(&signal_id);

        let guard = match self.locks.acquire(&signal_id, &run.id) {
            Ok(guard) => guard,
            Err(PipelineError::DuplicateInFlight { signal_id, holder }) => {
                self.metrics.inc_duplicates_rejected();
                emit_duplicate_rejected(&signal_id, &holder);
                return Err(PipelineError::DuplicateInFlight { signal_id, holder });
            }
            Err(e) => return Err(e),
        };

        emit_run_started(&run.id, &signal_id, &input.origin);
        let span = run_span(&run.id, &signal_id);
        if let Err(e) = self.drive(&mut run, input).instrument(span).await {
            error!(run_id = %run.id, phase = %run.phase, error = %e, "run failed");
            self.metrics.inc_runs_failed();
            run.finish(RunStatus::Error, Some(e.to_string()));
        }

        if let Err(e) = self.store.save_run(&run.id, &run) {
            warn!(run_id = %run.id, error = %e, "failed to persist run record");
        }
        emit_run_finished(&run.id, run.status.as_str(), run.duration_ms());
        drop(guard);
        Ok(run)
    }

    async fn drive(&self, run: &mut PipelineRun, input: SignalInput) -> PipelineResult<()> {
        let stage = self.begin(run, Phase::Capture)?;
        let signal = self.capture(input)?;
        stage.finish(run);

        let stage = self.begin(run, Phase::Connect)?;
        let connect = self.connect(&signal).await?;
        run.connect = Some(connect);
        stage.finish(run);

        let stage = self.begin(run, Phase::Meaning)?;
        let meaning = self.meaning(&signal).await?;
        let draft = meaning.draft.clone();
        run.meaning = Some(meaning);
        stage.finish(run);

        let stage = self.begin(run, Phase::Manifest)?;
        let manifest = self.manifest(&signal, &run.id, draft).await?;
        let decision = manifest.decision;
        let final_score = manifest.judgments.last().map(|j| j.score).unwrap_or(0);
        let revisions = manifest.revisions;
        let artifact = manifest.artifact.clone();
        run.manifest = Some(manifest);
        stage.finish(run);

        if decision != Decision::Pass {
            self.metrics.inc_runs_rejected();
            info!(run_id = %run.id, score = final_score, revisions, "artifact archived");
            run.finish(
                RunStatus::Rejected,
                Some(format!(
                    "quality gate archived the artifact (score {final_score}, {revisions} revision(s))"
                )),
            );
            return Ok(());
        }

        let stage = self.begin(run, Phase::Cycle)?;
        let cycle = self.cycle(&signal, run, &artifact, final_score, revisions)?;
        run.cycle = Some(cycle);
        stage.finish(run);

        self.metrics.inc_runs_published();
        run.finish(RunStatus::Published, None);
        Ok(())
    }

    fn begin(&self, run: &mut PipelineRun, phase: Phase) -> PipelineResult<StageTimer> {
        run.phase = phase;
        let context = self.tracker.guard(&run.id, phase.as_str()).ok_or_else(|| {
            PipelineError::CircularContext {
                chain: format!("{phase} -> {phase}"),
            }
        })?;
        Ok(StageTimer {
            phase,
            started_at: Utc::now(),
            clock: Instant::now(),
            _context: context,
        })
    }

    fn capture(&self, input: SignalInput) -> PipelineResult<Signal> {
        let signal = Signal::capture(input)?;
        let captured = self.store.save_signal(&signal)?;
        if matches!(captured, crate::store::Captured::Stored(_)) {
            self.metrics.inc_signals_captured();
        }
        Ok(captured.into_signal())
    }

    async fn connect(&self, signal: &Signal) -> PipelineResult<ConnectResult> {
        let score = if self.hub.is_active(RoleKey::Curator).await {
            let payload = json!({
                "prompt": format!(
                    "Score the content potential of this signal from 0 to 100. Reply with the number first.\n\n{}",
                    signal.text()
                ),
                "signal_id": signal.id,
            });
            match self
                .hub
                .request(
                    RoleKey::Junction,
                    RoleKey::Curator,
                    MessageKind::Request,
                    payload,
                    self.config.call_timeout(),
                )
                .await
            {
                Ok(reply) => parse_score(&reply_text(&reply)),
                Err(e) => {
                    warn!(signal_id = %signal.id, error = %e, "curator score unavailable");
                    None
                }
            }
        } else {
            None
        };

        let history = self
            .store
            .recent_signals(self.config.history_window, &signal.id)?;
        let connections = find_connections(
            signal,
            &history,
            self.config.top_k,
            self.config.min_overlap,
        );
        let potential = classify_potential(score, connections.len());
        Ok(ConnectResult {
            score,
            connections,
            potential,
            history_scanned: history.len(),
        })
    }

    async fn meaning(&self, signal: &Signal) -> PipelineResult<MeaningResult> {
        let active = self.hub.active_roles().await;
        let roles: Vec<RoleKey> = self
            .config
            .meaning_roles
            .iter()
            .copied()
            .filter(|r| active.contains(r))
            .collect();
        if roles.is_empty() {
            return Err(PipelineError::NoPerspectives {
                detail: "no meaning role is active".into(),
            });
        }

        let payload = json!({
            "prompt": format!("Give your perspective on this signal.\n\n{}", signal.text()),
            "signal_id": signal.id,
        });
        let targets: Vec<FanOutTarget> = roles
            .iter()
            .map(|role| FanOutTarget::new(*role, MessageKind::Request, payload.clone()))
            .collect();
        let results = self
            .fanout
            .execute(RoleKey::Junction, &targets, self.config.call_timeout())
            .await;

        let mut perspectives = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (role, outcome) in results {
            match outcome {
                Ok(value) => {
                    perspectives.insert(role, reply_text(&value));
                }
                Err(e) => {
                    failures.insert(role, e.to_string());
                }
            }
        }
        if perspectives.is_empty() {
            let detail = failures
                .iter()
                .map(|(role, reason)| format!("{role}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::NoPerspectives { detail });
        }

        let draft = self
            .ask(
                Phase::Meaning,
                RoleKey::Synthesizer,
                json!({
                    "prompt": synthesis_prompt(signal, &perspectives),
                    "signal_id": signal.id,
                }),
            )
            .await?;

        Ok(MeaningResult {
            perspectives,
            failures,
            draft,
        })
    }

    async fn manifest(
        &self,
        signal: &Signal,
        run_id: &str,
        draft: String,
    ) -> PipelineResult<ManifestResult> {
        let instruction = signal.text();
        let mut artifact = draft;
        let mut judgments: Vec<QualityJudgment> = Vec::new();
        let mut revisions = 0u32;

        loop {
            let judgment = self
                .gate
                .evaluate(&artifact, &instruction, self.config.artifact_type);
            self.validation.append(&ValidationRecord {
                timestamp: Utc::now(),
                signal_id: Some(signal.id.clone()),
                run_id: Some(run_id.to_string()),
                attempt: revisions,
                judgment: judgment.clone(),
            })?;
            emit_gate_evaluated(&signal.id, judgment.score, judgment.decision.as_str());

            let step = self.revisions.next_step(judgment.decision, revisions);
            let recommendations = judgment.recommendations.clone();
            judgments.push(judgment);

            match step {
                ManifestStep::Publish | ManifestStep::Archive => {
                    let decision = if step == ManifestStep::Publish {
                        Decision::Pass
                    } else {
                        Decision::Archive
                    };
                    return Ok(ManifestResult {
                        judgments,
                        revisions,
                        decision,
                        artifact,
                    });
                }
                ManifestStep::Revise => {
                    revisions += 1;
                    info!(signal_id = %signal.id, revision = revisions, "requesting revision");
                    artifact = self
                        .ask(
                            Phase::Manifest,
                            RoleKey::Synthesizer,
                            json!({
                                "prompt": revision_prompt(&artifact, &recommendations),
                                "signal_id": signal.id,
                                "revision": revisions,
                            }),
                        )
                        .await?;
                }
            }
        }
    }

    fn cycle(
        &self,
        signal: &Signal,
        run: &PipelineRun,
        artifact: &str,
        score: u32,
        revisions: u32,
    ) -> PipelineResult<CycleResult> {
        let published_at = Utc::now();
        let connect = run.connect.as_ref();
        let record = PublicationRecord {
            signal_id: signal.id.clone(),
            run_id: run.id.clone(),
            origin: signal.origin.clone(),
            published_at,
            artifact_type: self.config.artifact_type,
            score,
            revisions,
            potential: connect.map(|c| c.potential),
            connections: connect
                .map(|c| c.connections.iter().map(|c| c.signal_id.clone()).collect())
                .unwrap_or_default(),
            artifact_digest: crate::domain::ContentDigest::from_bytes(artifact.as_bytes()),
        };
        let path = self.store.publish(&signal.id, artifact, &record)?;
        info!(signal_id = %signal.id, path = %path.display(), "artifact published");
        Ok(CycleResult {
            published_path: path.display().to_string(),
            published_at,
        })
    }

    /// One request through the fan-out executor so it gets the same
    /// timeout, retry and cache treatment as the Meaning fan-out.
    async fn ask(&self, phase: Phase, role: RoleKey, payload: Value) -> PipelineResult<String> {
        let targets = [FanOutTarget::new(role, MessageKind::Request, payload)];
        let mut results = self
            .fanout
            .execute(RoleKey::Junction, &targets, self.config.call_timeout())
            .await;
        match results.remove(&role) {
            Some(Ok(value)) => {
                let text = reply_text(&value);
                if text.trim().is_empty() {
                    Err(PipelineError::stage(phase, format!("{role} returned no text")))
                } else {
                    Ok(text)
                }
            }
            Some(Err(e)) => Err(PipelineError::stage(phase, e.to_string())),
            None => Err(PipelineError::stage(phase, format!("{role} produced no outcome"))),
        }
    }
}

struct StageTimer {
    phase: Phase,
    started_at: DateTime<Utc>,
    clock: Instant,
    _context: ContextGuard,
}

impl StageTimer {
    fn finish(self, run: &mut PipelineRun) {
        let duration_ms = self.clock.elapsed().as_millis() as u64;
        emit_stage_completed(&run.id, self.phase.as_str(), duration_ms);
        run.timings.push(PhaseTiming {
            phase: self.phase,
            started_at: self.started_at,
            duration_ms,
        });
    }
}

fn synthesis_prompt(signal: &Signal, perspectives: &BTreeMap<RoleKey, String>) -> String {
    let mut prompt = format!(
        "Merge these perspectives into one finished piece.\n\n# Source\n\n{}\n",
        signal.text()
    );
    for (role, text) in perspectives {
        prompt.push_str(&format!("\n# {role}\n\n{text}\n"));
    }
    prompt
}

fn revision_prompt(artifact: &str, recommendations: &[String]) -> String {
    let mut prompt = String::from("Revise the draft below. Address every point:\n\n");
    for rec in recommendations {
        prompt.push_str(&format!("- {rec}\n"));
    }
    prompt.push_str("\n# Draft\n\n");
    prompt.push_str(artifact);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revise_is_capped_in_one_place() {
        let policy = RevisionPolicy::new(1);
        assert_eq!(policy.next_step(Decision::Pass, 0), ManifestStep::Publish);
        assert_eq!(policy.next_step(Decision::Revise, 0), ManifestStep::Revise);
        assert_eq!(policy.next_step(Decision::Revise, 1), ManifestStep::Archive);
        assert_eq!(policy.next_step(Decision::Archive, 0), ManifestStep::Archive);
    }

    #[test]
    fn zero_cap_never_revises() {
        let policy = RevisionPolicy::new(0);
        assert_eq!(policy.next_step(Decision::Revise, 0), ManifestStep::Archive);
        assert_eq!(policy.next_step(Decision::Pass, 5), ManifestStep::Publish);
    }

    #[test]
    fn synthesis_prompt_lists_each_perspective() {
        let signal = Signal::capture(SignalInput::text("chat", "tidal energy")).unwrap();
        let mut perspectives = BTreeMap::new();
        perspectives.insert(RoleKey::Analyst, "costs fall".to_string());
        perspectives.insert(RoleKey::Storyteller, "a coastal town".to_string());
        let prompt = synthesis_prompt(&signal, &perspectives);
        assert!(prompt.contains("tidal energy"));
        assert!(prompt.find("# analyst").unwrap() < prompt.find("# storyteller").unwrap());
    }

    #[test]
    fn revision_prompt_itemizes_recommendations() {
        let prompt = revision_prompt("draft body", &["add a title".into(), "expand".into()]);
        assert!(prompt.contains("- add a title\n- expand\n"));
        assert!(prompt.ends_with("draft body"));
    }
}
