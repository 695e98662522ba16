//! End-to-end pipeline runs against stub specialists.

use std::sync::Arc;
use std::time::Duration;

use junction_core::config::RetryPolicy;
use junction_core::hub::{handler_fn, MessageKind, RoleKey};
use junction_core::pipeline::{Phase, PipelineError, PipelineRun, Potential, RunStatus};
use junction_core::quality_gate::{Decision, ValidationLog};
use junction_core::{JunctionConfig, JunctionContext, Signal, SignalInput};
use serde_json::{json, Value};
use tokio::sync::Notify;

const SIGNAL: &str = "Tidal turbines could power coastal towns through winter storms";

fn context(dir: &std::path::Path, meaning_roles: Vec<RoleKey>) -> JunctionContext {
    let mut config = JunctionConfig {
        state_dir: dir.to_path_buf(),
        ..JunctionConfig::default()
    };
    config.pipeline.meaning_roles = meaning_roles;
    config.pipeline.call_timeout_ms = 2_000;
    config.pipeline.retry = RetryPolicy::none();
    JunctionContext::new(config).unwrap()
}

/// A well-formed article that mentions every keyword of [`SIGNAL`].
fn article() -> String {
    let filler = "Engineers measured the currents along the estuary and logged output hour by hour.\n"
        .repeat(12);
    format!(
        "# Tidal power for coastal towns\n\n\
         Tidal turbines could power coastal towns through winter storms, and the early data is encouraging.\n\n\
         ## What the pilot showed\n\n{filler}\n\n\
         ## What comes next\n\n{filler}\n"
    )
}

/// Scores in the revise band: aligned and tidy, but short and thin.
fn thin_draft() -> String {
    "# Tidal turbines\n\nTidal turbines could power coastal towns through winter storms. More soon.\n"
        .to_string()
}

async fn register_analyst(ctx: &JunctionContext) {
    ctx.hub
        .register(
            RoleKey::Analyst,
            handler_fn(|_| async { Ok(json!("steady, predictable output")) }),
        )
        .await;
}

async fn register_synthesizer<F>(ctx: &JunctionContext, reply: F)
where
    F: Fn(&Value) -> String + Send + Sync + 'static,
{
    let reply = Arc::new(reply);
    ctx.hub
        .register(
            RoleKey::Synthesizer,
            handler_fn(move |m| {
                let reply = Arc::clone(&reply);
                async move { Ok(json!(reply(&m.payload))) }
            }),
        )
        .await;
}

#[tokio::test]
async fn test_signal_without_history_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    register_analyst(&ctx).await;
    register_synthesizer(&ctx, |_| article()).await;

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL).with_id("sig-a"))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Published, "{:?}", run.reason);
    assert_eq!(run.phase, Phase::Cycle);
    let connect = run.connect.as_ref().unwrap();
    assert!(connect.connections.is_empty());
    assert_eq!(connect.score, None);
    assert_eq!(connect.potential, Potential::Low);

    let meaning = run.meaning.as_ref().unwrap();
    assert_eq!(meaning.perspectives.len(), 1);
    assert!(meaning.failures.is_empty());

    let manifest = run.manifest.as_ref().unwrap();
    assert_eq!(manifest.judgments.len(), 1);
    assert!(manifest.judgments[0].score >= 70);
    assert_eq!(manifest.decision, Decision::Pass);

    assert!(ctx.store.is_published("sig-a"));
    assert_eq!(run.timings.len(), 5);
    assert!(!ctx.executor.locks().is_held("sig-a"));

    let stored: PipelineRun = ctx.store.load_run(&run.id).unwrap();
    assert_eq!(stored, run);
    assert_eq!(ValidationLog::new(ctx.store.validation_log_path()).read_all().unwrap().len(), 1);
    assert_eq!(ctx.metrics.runs_published(), 1);
    assert_eq!(ctx.metrics.signals_captured(), 1);
}

#[tokio::test]
async fn test_duplicate_in_flight_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(context(dir.path(), vec![RoleKey::Analyst]));
    register_analyst(&ctx).await;

    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);
    ctx.hub
        .register(
            RoleKey::Synthesizer,
            handler_fn(move |_| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok(json!(article()))
                }
            }),
        )
        .await;

    let first = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            ctx.executor
                .submit(SignalInput::text("chat", SIGNAL).with_id("sig-b"))
                .await
        })
    };

    // Wait until the first run holds the lock.
    for _ in 0..200 {
        if ctx.executor.locks().is_held("sig-b") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(ctx.executor.locks().is_held("sig-b"));

    let second = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL).with_id("sig-b"))
        .await;
    assert!(matches!(second, Err(PipelineError::DuplicateInFlight { .. })));
    assert_eq!(ctx.metrics.duplicates_rejected(), 1);

    gate.notify_one();
    let run = first.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Published);
    assert!(!ctx.executor.locks().is_held("sig-b"));
}

#[tokio::test]
async fn test_revise_is_bounded_then_archived() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    register_analyst(&ctx).await;
    register_synthesizer(&ctx, |_| thin_draft()).await;

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL).with_id("sig-r"))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Rejected);
    assert!(run.reason.as_deref().unwrap().contains("archived"));
    let manifest = run.manifest.as_ref().unwrap();
    assert_eq!(manifest.revisions, 1);
    assert_eq!(manifest.judgments.len(), 2);
    assert_eq!(manifest.judgments[0].decision, Decision::Revise);
    // Unchanged artifact, unchanged score.
    assert_eq!(manifest.judgments[0], manifest.judgments[1]);
    assert_eq!(manifest.decision, Decision::Archive);

    assert!(run.cycle.is_none());
    assert!(!ctx.store.is_published("sig-r"));
    assert!(!ctx.executor.locks().is_held("sig-r"));
    assert_eq!(ctx.metrics.runs_rejected(), 1);
    assert_eq!(ValidationLog::new(ctx.store.validation_log_path()).read_all().unwrap().len(), 2);
}

#[tokio::test]
async fn test_revision_can_rescue_a_draft() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    register_analyst(&ctx).await;
    register_synthesizer(&ctx, |payload| {
        if payload.get("revision").is_some() {
            article()
        } else {
            thin_draft()
        }
    })
    .await;

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL).with_id("sig-rr"))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Published);
    let manifest = run.manifest.as_ref().unwrap();
    assert_eq!(manifest.revisions, 1);
    assert_eq!(manifest.judgments[1].decision, Decision::Pass);
}

#[tokio::test]
async fn test_stage_failure_ends_in_error_and_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    register_analyst(&ctx).await;
    // No synthesizer: Meaning cannot produce a draft.

    let input = SignalInput::text("chat", SIGNAL).with_id("sig-e");
    let run = ctx.executor.submit(input.clone()).await.unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.phase, Phase::Meaning);
    assert!(run.reason.as_deref().unwrap().contains("synthesizer"));
    assert!(!ctx.executor.locks().is_held("sig-e"));
    assert_eq!(ctx.metrics.runs_failed(), 1);

    // The signal is free again: a retry is a new run, not a duplicate.
    let retry = ctx.executor.submit(input).await.unwrap();
    assert_ne!(retry.id, run.id);
    assert_eq!(retry.status, RunStatus::Error);
}

#[tokio::test]
async fn test_no_active_meaning_role_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst, RoleKey::Storyteller]);
    register_synthesizer(&ctx, |_| article()).await;

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.reason.as_deref().unwrap().contains("no specialist"));
}

#[tokio::test]
async fn test_meaning_tolerates_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst, RoleKey::Storyteller]);
    register_analyst(&ctx).await;
    ctx.hub
        .register(
            RoleKey::Storyteller,
            handler_fn(|_| async {
                Err(junction_core::HubError::Handler {
                    role: "storyteller".into(),
                    reason: "no story here".into(),
                })
            }),
        )
        .await;
    register_synthesizer(&ctx, |_| article()).await;

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Published);
    let meaning = run.meaning.unwrap();
    assert!(meaning.perspectives.contains_key(&RoleKey::Analyst));
    assert!(meaning.failures[&RoleKey::Storyteller].contains("no story here"));
}

#[tokio::test]
async fn test_connect_links_history_and_uses_curator_score() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    register_analyst(&ctx).await;
    register_synthesizer(&ctx, |_| article()).await;
    ctx.hub
        .register(
            RoleKey::Curator,
            handler_fn(|m| async move {
                assert_eq!(m.kind, MessageKind::Request);
                Ok(json!("85 - strong local angle"))
            }),
        )
        .await;

    for (id, text) in [
        ("old-1", "winter storms battered coastal towns"),
        ("old-2", "tidal turbines installed offshore"),
        ("old-3", "a recipe for sourdough bread"),
    ] {
        let prior = Signal::capture(SignalInput::text("chat", text).with_id(id)).unwrap();
        ctx.store.save_signal(&prior).unwrap();
    }

    let run = ctx
        .executor
        .submit(SignalInput::text("chat", SIGNAL).with_id("sig-c"))
        .await
        .unwrap();

    let connect = run.connect.unwrap();
    assert_eq!(connect.score, Some(85));
    assert_eq!(connect.potential, Potential::High);
    assert_eq!(connect.history_scanned, 3);
    let ids: Vec<&str> = connect.connections.iter().map(|c| c.signal_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"old-1") && ids.contains(&"old-2"));
}

#[tokio::test]
async fn test_captured_payload_round_trips_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), vec![RoleKey::Analyst]);
    let payload = vec![0xff, 0x00, b'r', b'a', b'w', 0xc3, 0x28, b'\n'];
    let input = SignalInput {
        id: Some("sig-bytes".into()),
        origin: "camera".into(),
        payload: payload.clone(),
        media_ref: Some("img/0042.jpg".into()),
    };

    // No roles are active, so the run stops after Capture and Connect.
    let run = ctx.executor.submit(input).await.unwrap();
    assert_eq!(run.status, RunStatus::Error);

    let signal = ctx.store.load_signal("sig-bytes").unwrap();
    assert_eq!(signal.payload, payload);
    assert_eq!(signal.media_ref.as_deref(), Some("img/0042.jpg"));
}
