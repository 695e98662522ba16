//! Chat-channel front end: inbound text and slash-commands, and an outbound
//! rate limiter. The transport itself lives outside this crate; it hands
//! each inbound line to [`ChannelSession::handle`] and sends back the reply.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::hub::session::reply_text;
use crate::hub::{Hub, MessageKind, RoleKey};

const HELP: &str = "commands:\n\
/role <name>            switch the role plain text is sent to\n\
/status                 list roles and the active role\n\
/collab <r1,r2> <topic> ask several roles and report their consensus\n\
/help                   this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Text(String),
    Role(RoleKey),
    Status,
    Collab {
        participants: Vec<RoleKey>,
        topic: String,
    },
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one inbound line. Anything not starting with `/` is plain text.
pub fn parse_command(input: &str) -> Result<ChannelCommand, ChannelError> {
    let input = input.trim();
    let Some(rest) = input.strip_prefix('/') else {
        return Ok(ChannelCommand::Text(input.to_string()));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    match name.to_ascii_lowercase().as_str() {
        "role" => {
            if args.is_empty() {
                return Err(ChannelError::Usage("/role <name>"));
            }
            parse_role(args).map(ChannelCommand::Role)
        }
        "status" => Ok(ChannelCommand::Status),
        "help" | "start" => Ok(ChannelCommand::Help),
        "collab" => {
            let (roles, topic) = args
                .split_once(char::is_whitespace)
                .ok_or(ChannelError::Usage("/collab <r1,r2> <topic>"))?;
            let participants = roles
                .split(',')
                .filter(|r| !r.trim().is_empty())
                .map(parse_role)
                .collect::<Result<Vec<_>, _>>()?;
            let topic = topic.trim();
            if participants.is_empty() || topic.is_empty() {
                return Err(ChannelError::Usage("/collab <r1,r2> <topic>"));
            }
            Ok(ChannelCommand::Collab {
                participants,
                topic: topic.to_string(),
            })
        }
        other => Err(ChannelError::UnknownCommand(other.to_string())),
    }
}

fn parse_role(raw: &str) -> Result<RoleKey, ChannelError> {
    raw.parse::<RoleKey>()
        .map_err(|_| ChannelError::UnknownRole(raw.trim().to_string()))
}

/// Per-conversation state: which role plain text goes to.
pub struct ChannelSession {
    hub: Arc<Hub>,
    active_role: RoleKey,
    timeout: Duration,
}

impl ChannelSession {
    pub fn new(hub: Arc<Hub>, default_role: RoleKey, timeout: Duration) -> Self {
        Self {
            hub,
            active_role: default_role,
            timeout,
        }
    }

    pub fn active_role(&self) -> RoleKey {
        self.active_role
    }

    /// Handle one inbound line and produce the reply text. Failures become
    /// reply text; nothing here is surfaced as an error to the transport.
    pub async fn handle(&mut self, input: &str) -> String {
        let command = match parse_command(input) {
            Ok(command) => command,
            Err(e) => return e.to_string(),
        };
        debug!(command = ?command, "channel command");

        match command {
            ChannelCommand::Help => HELP.to_string(),
            ChannelCommand::Text(text) if text.is_empty() => HELP.to_string(),
            ChannelCommand::Text(text) => self.ask(text).await,
            ChannelCommand::Role(role) => {
                if self.hub.is_active(role).await {
                    self.active_role = role;
                    format!("active role: {role}")
                } else {
                    format!("role {role} is not active")
                }
            }
            ChannelCommand::Status => self.status().await,
            ChannelCommand::Collab {
                participants,
                topic,
            } => self.collaborate(&participants, &topic).await,
        }
    }

    async fn ask(&self, text: String) -> String {
        match self
            .hub
            .request(
                RoleKey::Junction,
                self.active_role,
                MessageKind::Request,
                json!({ "text": text }),
                self.timeout,
            )
            .await
        {
            Ok(reply) => reply_text(&reply),
            Err(e) => {
                warn!(role = %self.active_role, error = %e, "channel request failed");
                format!("{} is unavailable: {e}", self.active_role)
            }
        }
    }

    async fn status(&self) -> String {
        let mut lines = vec![format!("active role: {}", self.active_role)];
        for role in self.hub.roles().await {
            let mark = if role.active { "on " } else { "off" };
            lines.push(format!("[{mark}] {} ({})", role.key, role.name));
        }
        lines.join("\n")
    }

    async fn collaborate(&self, participants: &[RoleKey], topic: &str) -> String {
        let id = match self
            .hub
            .request_collaboration(
                RoleKey::Junction,
                participants,
                topic,
                Value::Null,
                self.timeout,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => return format!("collaboration failed: {e}"),
        };
        // The session finalizes itself on timeout; allow a little slack.
        match self
            .hub
            .wait_for_session(id, self.timeout + Duration::from_millis(250))
            .await
        {
            Ok(session) => match session.result {
                Some(result) => match result.consensus {
                    Some(consensus) => format!("{}\nconsensus: {consensus}", result.summary),
                    None => result.summary,
                },
                None => "collaboration still open".to_string(),
            },
            Err(e) => format!("collaboration failed: {e}"),
        }
    }
}

/// Caps outbound messages to `max_per_sec` in any one-second window.
pub struct OutboundRateLimiter {
    max_per_sec: usize,
    sent: Mutex<VecDeque<Instant>>,
}

impl OutboundRateLimiter {
    pub fn new(max_per_sec: usize) -> Self {
        Self {
            max_per_sec: max_per_sec.max(1),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a slot if one is free right now.
    pub async fn try_acquire(&self) -> bool {
        let mut sent = self.sent.lock().await;
        let now = Instant::now();
        prune(&mut sent, now);
        if sent.len() < self.max_per_sec {
            sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                prune(&mut sent, now);
                if sent.len() < self.max_per_sec {
                    sent.push_back(now);
                    return;
                }
                match sent.front() {
                    Some(oldest) => (*oldest + WINDOW).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

const WINDOW: Duration = Duration::from_secs(1);

fn prune(sent: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = sent.front() {
        if now.duration_since(*oldest) >= WINDOW {
            sent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::handler_fn;
    use crate::metrics::Metrics;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(
            parse_command("  what about rivers?  ").unwrap(),
            ChannelCommand::Text("what about rivers?".into())
        );
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command("/role Critic").unwrap(), ChannelCommand::Role(RoleKey::Critic));
        assert_eq!(parse_command("/status").unwrap(), ChannelCommand::Status);
        assert_eq!(parse_command("/HELP").unwrap(), ChannelCommand::Help);
        assert_eq!(
            parse_command("/collab analyst,critic is this worth writing up").unwrap(),
            ChannelCommand::Collab {
                participants: vec![RoleKey::Analyst, RoleKey::Critic],
                topic: "is this worth writing up".into(),
            }
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert_eq!(
            parse_command("/role").unwrap_err(),
            ChannelError::Usage("/role <name>")
        );
        assert_eq!(
            parse_command("/role wizard").unwrap_err(),
            ChannelError::UnknownRole("wizard".into())
        );
        assert_eq!(
            parse_command("/collab analyst").unwrap_err(),
            ChannelError::Usage("/collab <r1,r2> <topic>")
        );
        assert_eq!(
            parse_command("/dance").unwrap_err(),
            ChannelError::UnknownCommand("dance".into())
        );
    }

    #[tokio::test]
    async fn session_routes_text_to_active_role() {
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(Metrics::new())));
        hub.register(
            RoleKey::Critic,
            handler_fn(|m| async move { Ok(json!(format!("critic: {}", m.text().unwrap_or("")))) }),
        )
        .await;
        let mut session = ChannelSession::new(hub, RoleKey::Analyst, Duration::from_secs(1));

        let reply = session.handle("hello").await;
        assert!(reply.starts_with("analyst is unavailable"));

        assert_eq!(session.handle("/role critic").await, "active role: critic");
        assert_eq!(session.handle("hello").await, "critic: hello");
        assert_eq!(session.handle("/role archivist").await, "role archivist is not active");
        assert_eq!(session.active_role(), RoleKey::Critic);

        let status = session.handle("/status").await;
        assert!(status.contains("[on ] critic"));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_caps_per_second() {
        let limiter = OutboundRateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
