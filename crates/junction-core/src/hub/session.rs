//! Collaboration and voting sessions.
//!
//! A session finalizes exactly once. Both triggers (the last expected
//! response and the background timeout) take the sessions lock and only
//! the one that still observes `SessionStatus::Active` computes the result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::fanout::{Dispatch, FanOutExecutor, FanOutTarget};

use super::error::{HubError, HubResult};
use super::message::MessageKind;
use super::roles::RoleKey;
use super::router::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Collaboration,
    Voting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    TimedOut,
}

/// Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub consensus: Option<String>,
    pub summary: String,
    /// Collaboration: normalized response -> responders. Voting: option -> votes.
    pub tally: BTreeMap<String, usize>,
    pub responded: usize,
    pub expected: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub kind: SessionKind,
    pub initiator: RoleKey,
    /// Expected responders; never contains the initiator.
    pub participants: Vec<RoleKey>,
    pub topic: String,
    pub context: Value,
    /// Declared options (voting only).
    pub options: Vec<String>,
    pub responses: BTreeMap<RoleKey, String>,
    pub status: SessionStatus,
    pub result: Option<SessionResult>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    fn all_responded(&self) -> bool {
        self.responses.len() >= self.participants.len()
    }
}

pub(crate) struct SessionEntry {
    session: Session,
    done: watch::Sender<bool>,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn reply_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("option"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn collaboration_result(session: &Session, timed_out: bool) -> SessionResult {
    // Responses iterate in role order, so the first role seen for a group is
    // its lowest-ordered member.
    let mut groups: BTreeMap<String, (usize, RoleKey)> = BTreeMap::new();
    for (role, text) in &session.responses {
        let entry = groups.entry(normalize(text)).or_insert((0, *role));
        entry.0 += 1;
    }

    let best = groups
        .values()
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .copied();

    let responded = session.responses.len();
    let agreement = match best {
        Some((count, _)) if responded > 0 => count * 100 / responded,
        _ => 0,
    };
    SessionResult {
        consensus: best.and_then(|(_, role)| session.responses.get(&role).map(|t| t.trim().to_string())),
        summary: format!(
            "{}/{} participants responded, agreement {}%",
            responded,
            session.participants.len(),
            agreement
        ),
        tally: groups.into_iter().map(|(k, (n, _))| (k, n)).collect(),
        responded,
        expected: session.participants.len(),
        timed_out,
    }
}

fn voting_result(session: &Session, timed_out: bool) -> SessionResult {
    let mut counts: Vec<(String, usize)> = session.options.iter().map(|o| (o.clone(), 0)).collect();
    for vote in session.responses.values() {
        if let Some(slot) = counts.iter_mut().find(|(o, _)| o == vote) {
            slot.1 += 1;
        }
    }

    // Strictly greater keeps the first-listed option on ties.
    let mut winner: Option<(&str, usize)> = None;
    for (option, n) in &counts {
        if *n > 0 && winner.map_or(true, |(_, best)| *n > best) {
            winner = Some((option.as_str(), *n));
        }
    }

    let responded = session.responses.len();
    let summary = match winner {
        Some((option, n)) => format!(
            "{}/{} participants voted, '{}' won with {} vote(s)",
            responded,
            session.participants.len(),
            option,
            n
        ),
        None => format!("0/{} participants voted", session.participants.len()),
    };
    SessionResult {
        consensus: winner.map(|(o, _)| o.to_string()),
        summary,
        tally: counts.into_iter().collect(),
        responded,
        expected: session.participants.len(),
        timed_out,
    }
}

fn expected_participants(initiator: RoleKey, participants: &[RoleKey]) -> Vec<RoleKey> {
    let mut seen = HashSet::new();
    participants
        .iter()
        .copied()
        .filter(|r| *r != initiator && seen.insert(*r))
        .collect()
}

/// Drop the oldest finalized sessions beyond `retention`. Active sessions
/// are never evicted.
fn evict_finalized(sessions: &mut HashMap<Uuid, SessionEntry>, retention: usize) {
    let mut finalized: Vec<(DateTime<Utc>, Uuid)> = sessions
        .values()
        .filter(|e| !e.session.is_active())
        .map(|e| (e.session.finalized_at.unwrap_or(e.session.created_at), e.session.id))
        .collect();
    if finalized.len() <= retention {
        return;
    }
    finalized.sort();
    let excess = finalized.len() - retention;
    for (_, id) in finalized.into_iter().take(excess) {
        sessions.remove(&id);
    }
    debug!(evicted = excess, "finalized sessions evicted");
}

impl Hub {
    /// Open a collaboration session and query every participant other than
    /// the initiator. Returns immediately; replies are collected in the
    /// background and the session finalizes on the last reply or on
    /// `timeout`, whichever comes first.
    pub async fn request_collaboration(
        self: &Arc<Self>,
        initiator: RoleKey,
        participants: &[RoleKey],
        topic: &str,
        context: Value,
        timeout: Duration,
    ) -> HubResult<Uuid> {
        let participants = expected_participants(initiator, participants);
        let id = self
            .open_session(SessionKind::Collaboration, initiator, participants.clone(), topic, context.clone(), Vec::new())
            .await?;

        let payload = json!({ "session_id": id, "topic": topic, "context": context });
        self.spawn_collection(id, initiator, participants, MessageKind::Query, payload, timeout);
        info!(session_id = %id, initiator = %initiator, "collaboration opened");
        Ok(id)
    }

    /// Record one free-text response. Returns `true` when this response
    /// finalized the session.
    pub async fn submit_collaboration_response(
        &self,
        id: Uuid,
        role: RoleKey,
        response: &str,
    ) -> HubResult<bool> {
        self.record_response(id, SessionKind::Collaboration, role, response.to_string())
            .await
    }

    /// Open a voting session over `options`. Participants receive a `Vote`
    /// request; a reply naming one of the options is cast automatically and
    /// `cast_vote` accepts votes out of band.
    pub async fn start_voting(
        self: &Arc<Self>,
        initiator: RoleKey,
        participants: &[RoleKey],
        topic: &str,
        options: &[String],
        timeout: Duration,
    ) -> HubResult<Uuid> {
        let participants = expected_participants(initiator, participants);
        let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
        let id = self
            .open_session(SessionKind::Voting, initiator, participants.clone(), topic, Value::Null, options.clone())
            .await?;

        let payload = json!({ "session_id": id, "topic": topic, "options": options });
        self.spawn_collection(id, initiator, participants, MessageKind::Vote, payload, timeout);
        info!(session_id = %id, initiator = %initiator, "voting opened");
        Ok(id)
    }

    /// Cast one vote. Returns `true` when this vote finalized the session.
    pub async fn cast_vote(&self, id: Uuid, role: RoleKey, option: &str) -> HubResult<bool> {
        self.record_response(id, SessionKind::Voting, role, option.trim().to_string())
            .await
    }

    pub async fn session(&self, id: Uuid) -> Option<Session> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    /// Wait until the session finalizes or `timeout` elapses, then return
    /// its current state.
    pub async fn wait_for_session(&self, id: Uuid, timeout: Duration) -> HubResult<Session> {
        let mut rx = {
            let sessions = self.sessions.lock().await;
            let entry = sessions.get(&id).ok_or(HubError::SessionNotFound(id))?;
            entry.done.subscribe()
        };
        let _ = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await;
        self.session(id).await.ok_or(HubError::SessionNotFound(id))
    }

    async fn open_session(
        &self,
        kind: SessionKind,
        initiator: RoleKey,
        participants: Vec<RoleKey>,
        topic: &str,
        context: Value,
        options: Vec<String>,
    ) -> HubResult<Uuid> {
        if participants.is_empty() {
            return Err(HubError::NoParticipants);
        }
        let session = Session {
            id: Uuid::new_v4(),
            kind,
            initiator,
            participants,
            topic: topic.to_string(),
            context,
            options,
            responses: BTreeMap::new(),
            status: SessionStatus::Active,
            result: None,
            created_at: Utc::now(),
            finalized_at: None,
        };
        let id = session.id;
        let (done, _) = watch::channel(false);
        self.sessions
            .lock()
            .await
            .insert(id, SessionEntry { session, done });
        Ok(id)
    }

    /// Query every participant and record each reply as soon as it
    /// arrives; a slow participant never holds back the others. The session
    /// times out independently of the calls.
    fn spawn_collection(
        self: &Arc<Self>,
        id: Uuid,
        initiator: RoleKey,
        participants: Vec<RoleKey>,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let dispatch: Arc<dyn Dispatch> = Arc::clone(&hub) as Arc<dyn Dispatch>;
            let executor = FanOutExecutor::new(dispatch, Arc::clone(&hub.metrics));
            let targets: Vec<FanOutTarget> = participants
                .iter()
                .map(|role| FanOutTarget::new(*role, kind, payload.clone()))
                .collect();

            let mut pending: FuturesUnordered<_> = targets
                .iter()
                .map(|target| executor.execute(initiator, std::slice::from_ref(target), timeout))
                .collect();
            while let Some(outcomes) = pending.next().await {
                for (role, outcome) in outcomes {
                    let Ok(value) = outcome else { continue };
                    let text = reply_text(&value);
                    let submitted = match kind {
                        MessageKind::Vote => hub.cast_vote(id, role, &text).await,
                        _ => hub.submit_collaboration_response(id, role, &text).await,
                    };
                    if let Err(e) = submitted {
                        debug!(session_id = %id, role = %role, error = %e, "reply not recorded");
                    }
                }
            }
        });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hub.finalize(id, true).await;
        });
    }

    async fn record_response(
        &self,
        id: Uuid,
        kind: SessionKind,
        role: RoleKey,
        response: String,
    ) -> HubResult<bool> {
        let complete = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&id)
                .filter(|e| e.session.kind == kind)
                .ok_or(HubError::SessionNotFound(id))?;
            let session = &mut entry.session;
            if !session.is_active() {
                return Err(HubError::SessionClosed(id));
            }
            if !session.participants.contains(&role) {
                return Err(HubError::NotParticipant {
                    role: role.to_string(),
                    session: id,
                });
            }
            if session.responses.contains_key(&role) {
                return Err(HubError::DuplicateResponse {
                    role: role.to_string(),
                    session: id,
                });
            }
            if kind == SessionKind::Voting && !session.options.contains(&response) {
                return Err(HubError::InvalidOption { option: response });
            }
            session.responses.insert(role, response);
            session.all_responded()
        };

        if complete {
            Ok(self.finalize(id, false).await)
        } else {
            Ok(false)
        }
    }

    /// The single active -> completed transition. Returns `false` when the
    /// session was already final.
    async fn finalize(&self, id: Uuid, timed_out: bool) -> bool {
        let (initiator, topic, result) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&id) else {
                return false;
            };
            if !entry.session.is_active() {
                return false;
            }
            let session = &mut entry.session;
            let result = match session.kind {
                SessionKind::Collaboration => collaboration_result(session, timed_out),
                SessionKind::Voting => voting_result(session, timed_out),
            };
            session.status = if timed_out {
                SessionStatus::TimedOut
            } else {
                SessionStatus::Completed
            };
            session.result = Some(result.clone());
            session.finalized_at = Some(Utc::now());
            let finalized = (session.initiator, session.topic.clone(), result);
            entry.done.send_replace(true);
            evict_finalized(&mut sessions, self.config().session_retention);
            finalized
        };

        self.metrics.inc_sessions_finalized();
        info!(session_id = %id, timed_out, summary = %result.summary, "session finalized");
        self.broadcast(
            initiator,
            MessageKind::Decision,
            json!({
                "session_id": id,
                "topic": topic,
                "consensus": result.consensus,
                "summary": result.summary,
            }),
            &[],
        )
        .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(responses: &[(RoleKey, &str)], participants: &[RoleKey]) -> Session {
        Session {
            id: Uuid::new_v4(),
            kind: SessionKind::Collaboration,
            initiator: RoleKey::Junction,
            participants: participants.to_vec(),
            topic: "t".into(),
            context: Value::Null,
            options: vec!["yes".into(), "no".into()],
            responses: responses.iter().map(|(r, t)| (*r, t.to_string())).collect(),
            status: SessionStatus::Active,
            result: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn consensus_is_majority_after_normalization() {
        let s = session(
            &[
                (RoleKey::Analyst, "Ship it"),
                (RoleKey::Critic, "ship   IT"),
                (RoleKey::Archivist, "wait"),
            ],
            &[RoleKey::Analyst, RoleKey::Critic, RoleKey::Archivist],
        );
        let r = collaboration_result(&s, false);
        assert_eq!(r.consensus.as_deref(), Some("Ship it"));
        assert_eq!(r.summary, "3/3 participants responded, agreement 66%");
        assert_eq!(r.tally.get("ship it"), Some(&2));
    }

    #[test]
    fn consensus_tie_prefers_lowest_role() {
        let s = session(
            &[(RoleKey::Critic, "b"), (RoleKey::Analyst, "a")],
            &[RoleKey::Analyst, RoleKey::Critic],
        );
        let r = collaboration_result(&s, false);
        assert_eq!(r.consensus.as_deref(), Some("a"));
    }

    #[test]
    fn empty_collaboration_has_no_consensus() {
        let s = session(&[], &[RoleKey::Analyst]);
        let r = collaboration_result(&s, true);
        assert!(r.consensus.is_none());
        assert!(r.timed_out);
        assert_eq!(r.summary, "0/1 participants responded, agreement 0%");
    }

    #[test]
    fn vote_tie_prefers_first_listed_option() {
        let mut s = session(
            &[(RoleKey::Analyst, "no"), (RoleKey::Critic, "yes")],
            &[RoleKey::Analyst, RoleKey::Critic],
        );
        s.kind = SessionKind::Voting;
        let r = voting_result(&s, false);
        assert_eq!(r.consensus.as_deref(), Some("yes"));
        assert_eq!(r.tally.get("no"), Some(&1));
    }

    fn entry(finalized_secs_ago: Option<i64>) -> SessionEntry {
        let mut s = session(&[], &[RoleKey::Analyst]);
        if let Some(ago) = finalized_secs_ago {
            s.status = SessionStatus::Completed;
            s.finalized_at = Some(Utc::now() - chrono::Duration::seconds(ago));
        }
        let (done, _) = watch::channel(s.finalized_at.is_some());
        SessionEntry { session: s, done }
    }

    #[test]
    fn eviction_keeps_newest_finalized_and_all_active() {
        let mut sessions = HashMap::new();
        let mut ids = Vec::new();
        for e in [entry(None), entry(Some(30)), entry(Some(20)), entry(Some(10))] {
            ids.push(e.session.id);
            sessions.insert(e.session.id, e);
        }

        evict_finalized(&mut sessions, 2);
        assert_eq!(sessions.len(), 3);
        assert!(sessions.contains_key(&ids[0]));
        assert!(!sessions.contains_key(&ids[1]));
        assert!(sessions.contains_key(&ids[3]));

        evict_finalized(&mut sessions, 0);
        assert_eq!(sessions.keys().collect::<Vec<_>>(), vec![&ids[0]]);
    }

    #[test]
    fn initiator_and_duplicates_are_not_expected() {
        let p = expected_participants(
            RoleKey::Analyst,
            &[RoleKey::Analyst, RoleKey::Critic, RoleKey::Critic],
        );
        assert_eq!(p, vec![RoleKey::Critic]);
    }
}
