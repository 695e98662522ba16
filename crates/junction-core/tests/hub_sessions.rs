//! Collaboration and voting sessions on the hub.

use std::sync::Arc;
use std::time::Duration;

use junction_core::config::HubConfig;
use junction_core::hub::{handler_fn, Hub, HubError, MessageKind, RoleKey, SessionStatus};
use junction_core::Metrics;
use serde_json::{json, Value};

fn hub() -> (Arc<Hub>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    (
        Arc::new(Hub::new(HubConfig::default(), Arc::clone(&metrics))),
        metrics,
    )
}

/// Replies `text` to queries and ignores everything else.
async fn answer(hub: &Hub, role: RoleKey, text: &'static str) {
    hub.register(
        role,
        handler_fn(move |m| async move {
            match m.kind {
                MessageKind::Query | MessageKind::Vote => Ok(json!(text)),
                _ => Ok(Value::Null),
            }
        }),
    )
    .await;
}

#[tokio::test]
async fn test_collaboration_reaches_consensus() {
    let (hub, metrics) = hub();
    answer(&hub, RoleKey::Analyst, "Yes").await;
    answer(&hub, RoleKey::Critic, "  yes ").await;
    answer(&hub, RoleKey::Storyteller, "no").await;

    let id = hub
        .request_collaboration(
            RoleKey::Junction,
            &[RoleKey::Analyst, RoleKey::Critic, RoleKey::Storyteller],
            "publish the river piece?",
            json!({ "signal_id": "s-1" }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let session = hub.wait_for_session(id, Duration::from_secs(3)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let result = session.result.unwrap();
    assert_eq!(result.consensus.as_deref(), Some("Yes"));
    assert_eq!(result.summary, "3/3 participants responded, agreement 66%");
    assert_eq!(result.tally.get("yes"), Some(&2));
    assert!(!result.timed_out);
    assert_eq!(metrics.sessions_finalized(), 1);
}

#[tokio::test]
async fn test_collaboration_times_out_with_missing_responses() {
    let (hub, _) = hub();
    answer(&hub, RoleKey::Analyst, "ship it").await;
    hub.register(
        RoleKey::Critic,
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("too late"))
        }),
    )
    .await;

    let id = hub
        .request_collaboration(
            RoleKey::Junction,
            &[RoleKey::Analyst, RoleKey::Critic],
            "topic",
            Value::Null,
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    let session = hub.wait_for_session(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(session.status, SessionStatus::TimedOut);
    let result = session.result.unwrap();
    assert!(result.timed_out);
    assert_eq!(result.responded, 1);
    assert_eq!(result.expected, 2);
    assert_eq!(result.consensus.as_deref(), Some("ship it"));
}

#[tokio::test]
async fn test_initiator_is_not_an_expected_participant() {
    let (hub, _) = hub();
    let err = hub
        .request_collaboration(
            RoleKey::Critic,
            &[RoleKey::Critic],
            "alone",
            Value::Null,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NoParticipants));
}

#[tokio::test]
async fn test_voting_rejects_invalid_votes_and_finalizes_on_last_vote() {
    let (hub, _) = hub();
    let options = vec!["publish".to_string(), "archive".to_string()];
    // Participants are inactive, so every vote arrives out of band.
    let id = hub
        .start_voting(
            RoleKey::Junction,
            &[RoleKey::Analyst, RoleKey::Critic],
            "fate of draft 7",
            &options,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    assert!(!hub.cast_vote(id, RoleKey::Analyst, "publish").await.unwrap());
    assert!(matches!(
        hub.cast_vote(id, RoleKey::Analyst, "archive").await,
        Err(HubError::DuplicateResponse { .. })
    ));
    assert!(matches!(
        hub.cast_vote(id, RoleKey::Storyteller, "publish").await,
        Err(HubError::NotParticipant { .. })
    ));
    assert!(matches!(
        hub.cast_vote(id, RoleKey::Critic, "maybe").await,
        Err(HubError::InvalidOption { .. })
    ));

    assert!(hub.cast_vote(id, RoleKey::Critic, "archive").await.unwrap());
    assert!(matches!(
        hub.cast_vote(id, RoleKey::Critic, "publish").await,
        Err(HubError::SessionClosed(_))
    ));

    let session = hub.session(id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let result = session.result.unwrap();
    // One vote each: the first-listed option wins the tie.
    assert_eq!(result.consensus.as_deref(), Some("publish"));
    assert_eq!(result.summary, "2/2 participants voted, 'publish' won with 1 vote(s)");
}

#[tokio::test]
async fn test_voting_timeout_with_no_votes() {
    let (hub, _) = hub();
    let id = hub
        .start_voting(
            RoleKey::Junction,
            &[RoleKey::Critic],
            "quiet room",
            &["a".to_string(), "b".to_string()],
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    let session = hub.wait_for_session(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(session.status, SessionStatus::TimedOut);
    let result = session.result.unwrap();
    assert_eq!(result.consensus, None);
    assert_eq!(result.summary, "0/1 participants voted");
}

#[tokio::test]
async fn test_session_finalizes_once_when_last_vote_races_timeout() {
    let (hub, metrics) = hub();
    let options = vec!["yes".to_string(), "no".to_string()];
    let rounds = 25u64;

    for round in 0..rounds {
        let id = hub
            .start_voting(
                RoleKey::Junction,
                &[RoleKey::Critic],
                "race",
                &options,
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        // Land the vote right around the timer.
        tokio::time::sleep(Duration::from_millis(18 + round % 5)).await;
        let voted = hub.cast_vote(id, RoleKey::Critic, "yes").await;

        let session = hub.wait_for_session(id, Duration::from_secs(1)).await.unwrap();
        assert!(!session.is_active());
        match voted {
            // The vote finalized the session.
            Ok(true) => assert_eq!(session.status, SessionStatus::Completed),
            // The timer won: the vote was refused, or recorded just before
            // the timer closed the session.
            Err(HubError::SessionClosed(_)) | Ok(false) => {
                assert_eq!(session.status, SessionStatus::TimedOut)
            }
            other => panic!("unexpected vote outcome: {other:?}"),
        }

        // Let the losing trigger fire, then make sure nothing changed.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hub.session(id).await.unwrap(), session);
        assert_eq!(metrics.sessions_finalized(), round + 1);
    }
}

#[tokio::test]
async fn test_finalization_broadcasts_decision() {
    let (hub, _) = hub();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    hub.register(
        RoleKey::Archivist,
        handler_fn(move |m| {
            let tx = tx.clone();
            async move {
                if m.kind == MessageKind::Decision {
                    let _ = tx.send(m.payload.clone());
                }
                Ok(Value::Null)
            }
        }),
    )
    .await;

    let id = hub
        .start_voting(
            RoleKey::Junction,
            &[RoleKey::Critic],
            "announce",
            &["go".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    hub.cast_vote(id, RoleKey::Critic, "go").await.unwrap();

    let decision = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decision["session_id"], json!(id));
}

/// Replies `text` to every request after `delay`.
async fn answer_after(hub: &Hub, role: RoleKey, text: &'static str, delay: Duration) {
    hub.register(
        role,
        handler_fn(move |_| async move {
            tokio::time::sleep(delay).await;
            Ok(json!(text))
        }),
    )
    .await;
}

#[tokio::test]
async fn test_early_reply_is_recorded_while_peer_is_slow() {
    let (hub, _) = hub();
    answer(&hub, RoleKey::Analyst, "go").await;
    answer_after(&hub, RoleKey::Critic, "too late", Duration::from_secs(30)).await;

    let id = hub
        .request_collaboration(
            RoleKey::Junction,
            &[RoleKey::Analyst, RoleKey::Critic],
            "launch?",
            Value::Null,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let open = hub.session(id).await.unwrap();
    assert!(open.is_active());
    assert_eq!(open.responses.get(&RoleKey::Analyst).map(String::as_str), Some("go"));

    let session = hub.wait_for_session(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(session.status, SessionStatus::TimedOut);
    let result = session.result.unwrap();
    assert_eq!(result.responded, 1);
    assert_eq!(result.consensus.as_deref(), Some("go"));
}

#[tokio::test]
async fn test_votes_before_timeout_count_despite_slow_voter() {
    let (hub, _) = hub();
    answer(&hub, RoleKey::Analyst, "publish").await;
    answer(&hub, RoleKey::Storyteller, "publish").await;
    answer_after(&hub, RoleKey::Critic, "archive", Duration::from_secs(30)).await;

    let id = hub
        .start_voting(
            RoleKey::Junction,
            &[RoleKey::Analyst, RoleKey::Storyteller, RoleKey::Critic],
            "fate of draft 9",
            &["publish".to_string(), "archive".to_string()],
            Duration::from_millis(400),
        )
        .await
        .unwrap();

    let session = hub.wait_for_session(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(session.status, SessionStatus::TimedOut);
    let result = session.result.unwrap();
    assert_eq!(result.responded, 2);
    assert_eq!(result.consensus.as_deref(), Some("publish"));
    assert_eq!(result.summary, "2/3 participants voted, 'publish' won with 2 vote(s)");
}

#[tokio::test]
async fn test_finalized_sessions_are_retained_up_to_capacity() {
    let metrics = Arc::new(Metrics::new());
    let config = HubConfig {
        session_retention: 3,
        ..HubConfig::default()
    };
    let hub = Arc::new(Hub::new(config, Arc::clone(&metrics)));
    let options = vec!["yes".to_string()];

    let open = hub
        .start_voting(RoleKey::Junction, &[RoleKey::Archivist], "still open", &options, Duration::from_secs(30))
        .await
        .unwrap();

    let mut closed = Vec::new();
    for _ in 0..20 {
        let id = hub
            .start_voting(RoleKey::Junction, &[RoleKey::Critic], "quick", &options, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(hub.cast_vote(id, RoleKey::Critic, "yes").await.unwrap());
        closed.push(id);
        // Distinct finalization timestamps keep eviction order deterministic.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(metrics.sessions_finalized(), 20);
    assert!(hub.session(open).await.unwrap().is_active());
    for id in &closed[..17] {
        assert!(hub.session(*id).await.is_none());
    }
    for id in &closed[17..] {
        assert!(hub.session(*id).await.is_some());
    }
}
