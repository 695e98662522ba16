//! Role vocabulary: `RoleKey`, `RoleDefinition`, `RoleHandler`.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{HubError, HubResult};
use super::message::Message;

/// The closed set of roles the hub routes between.
///
/// Ordering is significant: it is the tie-break order for collaboration
/// consensus and the iteration order of fan-out result maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKey {
    /// Scores an incoming signal and judges its content potential.
    Curator,
    /// Extracts the argument and implications of a signal.
    Analyst,
    /// Finds the narrative angle of a signal.
    Storyteller,
    /// Merges specialist perspectives into a draft.
    Synthesizer,
    /// Reviews drafts and answers collaboration queries.
    Critic,
    /// Keeps track of published material.
    Archivist,
    /// The pipeline executor's own identity on the hub.
    Junction,
    /// The self-healing supervisor's identity on the hub.
    Sentinel,
}

impl RoleKey {
    pub const ALL: [RoleKey; 8] = [
        RoleKey::Curator,
        RoleKey::Analyst,
        RoleKey::Storyteller,
        RoleKey::Synthesizer,
        RoleKey::Critic,
        RoleKey::Archivist,
        RoleKey::Junction,
        RoleKey::Sentinel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKey::Curator => "curator",
            RoleKey::Analyst => "analyst",
            RoleKey::Storyteller => "storyteller",
            RoleKey::Synthesizer => "synthesizer",
            RoleKey::Critic => "critic",
            RoleKey::Archivist => "archivist",
            RoleKey::Junction => "junction",
            RoleKey::Sentinel => "sentinel",
        }
    }
}

impl std::fmt::Display for RoleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleKey {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        RoleKey::ALL
            .into_iter()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| HubError::UnknownRole(s.to_string()))
    }
}

/// Static description of a role. Definitions do not execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefinition {
    pub key: RoleKey,
    pub name: &'static str,
    pub description: &'static str,
    /// Lower runs first when roles are listed to operators.
    pub priority: u8,
    /// System persona handed to the text-generation service.
    pub persona: &'static str,
}

/// The registry table: one definition per [`RoleKey`].
pub fn standard_roles() -> Vec<RoleDefinition> {
    RoleKey::ALL.into_iter().map(definition).collect()
}

pub fn definition(key: RoleKey) -> RoleDefinition {
    let (name, description, priority, persona) = match key {
        RoleKey::Curator => (
            "Curator",
            "Scores incoming signals and judges their content potential",
            1,
            "You are a curator. Rate how much publishable substance the note holds, \
             from 0 to 100, and answer with the number first.",
        ),
        RoleKey::Analyst => (
            "Analyst",
            "Extracts the core argument and its implications",
            2,
            "You are an analyst. State the core idea of the note, the evidence behind it \
             and what follows from it.",
        ),
        RoleKey::Storyteller => (
            "Storyteller",
            "Finds the narrative angle and the human stakes",
            2,
            "You are a storyteller. Find the narrative in the note: who is involved, \
             what changed, and why a reader should care.",
        ),
        RoleKey::Synthesizer => (
            "Synthesizer",
            "Merges specialist perspectives into a structured draft",
            3,
            "You are an editor. Merge the perspectives you are given into one markdown \
             article with a title and sections.",
        ),
        RoleKey::Critic => (
            "Critic",
            "Reviews drafts and answers collaboration queries",
            4,
            "You are a critic. Point out the weakest claim and the missing context.",
        ),
        RoleKey::Archivist => (
            "Archivist",
            "Keeps track of what has been published",
            5,
            "You are an archivist. Relate the note to earlier published material.",
        ),
        RoleKey::Junction => (
            "Junction",
            "Pipeline executor identity",
            0,
            "",
        ),
        RoleKey::Sentinel => (
            "Sentinel",
            "Self-healing supervisor identity",
            0,
            "",
        ),
    };
    RoleDefinition {
        key,
        name,
        description,
        priority,
        persona,
    }
}

/// The one capability every role implements.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> HubResult<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RoleHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HubResult<Value>> + Send,
{
    async fn handle(&self, message: &Message) -> HubResult<Value> {
        (self.0)(message.clone()).await
    }
}

/// Wrap an async closure as a [`RoleHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RoleHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_one_definition_per_role() {
        let roles = standard_roles();
        assert_eq!(roles.len(), RoleKey::ALL.len());
        for (def, key) in roles.iter().zip(RoleKey::ALL) {
            assert_eq!(def.key, key);
        }
    }

    #[test]
    fn role_key_parses_case_insensitively() {
        assert_eq!("Analyst".parse::<RoleKey>().unwrap(), RoleKey::Analyst);
        assert_eq!(" critic ".parse::<RoleKey>().unwrap(), RoleKey::Critic);
        assert!(matches!(
            "poet".parse::<RoleKey>(),
            Err(HubError::UnknownRole(_))
        ));
    }

    #[test]
    fn role_key_serde_is_snake_case() {
        let json = serde_json::to_string(&RoleKey::Storyteller).unwrap();
        assert_eq!(json, "\"storyteller\"");
    }

    #[test]
    fn specialist_roles_carry_personas() {
        for key in [RoleKey::Curator, RoleKey::Analyst, RoleKey::Synthesizer] {
            assert!(!definition(key).persona.is_empty());
        }
        assert!(definition(RoleKey::Junction).persona.is_empty());
    }
}
