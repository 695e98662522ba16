//! Seam to the external text-generation service.
//!
//! The service is an opaque command: the role persona travels in the
//! `JUNCTION_ROLE` / `JUNCTION_PERSONA` environment variables, the task
//! prompt on stdin, and the completion comes back on stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::GeneratorConfig;
use crate::hub::{definition, HubError, HubResult, Message, RoleHandler, RoleKey};

/// Exit status a generator uses to signal "try again later" (EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Timeouts and rate limits.
    #[error("transient generation failure: {0}")]
    Transient(String),

    #[error("generation failed: {0}")]
    Failed(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, persona: &str, prompt: &str) -> Result<String, GenerationError>;
}

/// Runs an external command per generation.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    role: Option<RoleKey>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            role: None,
        }
    }

    /// Tag invocations with the calling role.
    pub fn for_role(mut self, role: RoleKey) -> Self {
        self.role = Some(role);
        self
    }
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    async fn generate(&self, persona: &str, prompt: &str) -> Result<String, GenerationError> {
        let Some((exe, args)) = self.command.split_first() else {
            return Err(GenerationError::Failed("generator command is empty".into()));
        };
        let start = Instant::now();

        let mut child = Command::new(exe)
            .args(args)
            .env("JUNCTION_PERSONA", persona)
            .env(
                "JUNCTION_ROLE",
                self.role.map(|r| r.as_str()).unwrap_or_default(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GenerationError::Failed(format!("spawn {exe}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits without reading its prompt is judged by
            // its exit status, not by the broken pipe.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(GenerationError::Failed(format!("write prompt: {e}")));
                }
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                GenerationError::Transient(format!(
                    "{exe} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| GenerationError::Failed(format!("wait {exe}: {e}")))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(EXIT_TEMPFAIL) => GenerationError::Transient(stderr),
                code => GenerationError::Failed(format!("{exe} exited with {code:?}: {stderr}")),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::Failed(format!("{exe} produced no output")));
        }
        debug!(command = %exe, duration_ms, bytes = text.len(), "generation completed");
        Ok(text)
    }
}

/// Tries the primary provider, then the fallback on any failure.
pub struct FallbackGenerator {
    primary: Arc<dyn TextGenerator>,
    fallback: Arc<dyn TextGenerator>,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn TextGenerator>, fallback: Arc<dyn TextGenerator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl TextGenerator for FallbackGenerator {
    async fn generate(&self, persona: &str, prompt: &str) -> Result<String, GenerationError> {
        match self.primary.generate(persona, prompt).await {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(error = %e, "primary generator failed, using fallback");
                self.fallback.generate(persona, prompt).await
            }
        }
    }
}

/// Build the generator described by `config`, or `None` when no command is
/// configured.
pub fn from_config(config: &GeneratorConfig, role: RoleKey) -> Option<Arc<dyn TextGenerator>> {
    let timeout = Duration::from_millis(config.timeout_ms);
    if config.command.is_empty() {
        return None;
    }
    let primary: Arc<dyn TextGenerator> =
        Arc::new(CommandGenerator::new(config.command.clone(), timeout).for_role(role));
    if config.fallback_command.is_empty() {
        return Some(primary);
    }
    let fallback: Arc<dyn TextGenerator> =
        Arc::new(CommandGenerator::new(config.fallback_command.clone(), timeout).for_role(role));
    Some(Arc::new(FallbackGenerator::new(primary, fallback)))
}

/// A role handler backed by a text generator and the role's persona.
pub struct SpecialistHandler {
    role: RoleKey,
    generator: Arc<dyn TextGenerator>,
}

impl SpecialistHandler {
    pub fn new(role: RoleKey, generator: Arc<dyn TextGenerator>) -> Self {
        Self { role, generator }
    }
}

#[async_trait]
impl RoleHandler for SpecialistHandler {
    async fn handle(&self, message: &Message) -> HubResult<Value> {
        let prompt = match message.text() {
            Some(text) => text.to_string(),
            None => message.payload.to_string(),
        };
        let persona = definition(self.role).persona;
        self.generator
            .generate(persona, &prompt)
            .await
            .map(Value::String)
            .map_err(|e| match e {
                GenerationError::Transient(reason) => HubError::Transient {
                    role: self.role.to_string(),
                    reason,
                },
                GenerationError::Failed(reason) => HubError::Handler {
                    role: self.role.to_string(),
                    reason,
                },
            })
    }
}
