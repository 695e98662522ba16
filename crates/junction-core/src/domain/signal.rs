//! Signals: the unit of captured input entering the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::digest::ContentDigest;
use super::error::{JunctionError, Result};

const MAX_ID_LEN: usize = 128;

/// Raw input as handed over by a channel or an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInput {
    /// Caller-supplied identity. When absent the identity is derived from
    /// the content, so resubmitting identical content collides.
    pub id: Option<String>,
    pub origin: String,
    pub payload: Vec<u8>,
    pub media_ref: Option<String>,
}

impl SignalInput {
    pub fn text(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            origin: origin.into(),
            payload: text.into().into_bytes(),
            media_ref: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_ref = Some(media_ref.into());
        self
    }

    /// The identity this input will be captured under.
    pub fn resolve_id(&self) -> Result<String> {
        match &self.id {
            Some(id) => {
                validate_id(id)?;
                Ok(id.clone())
            }
            None => Ok(ContentDigest::from_parts(&[self.origin.as_bytes(), &self.payload])
                .short()
                .to_string()),
        }
    }
}

/// A captured signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub origin: String,
    pub media_ref: Option<String>,
    pub payload_digest: ContentDigest,
    pub payload_len: usize,
    /// Stored as a separate blob so bytes round-trip exactly.
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl Signal {
    /// Validate an input and freeze it into a signal.
    pub fn capture(input: SignalInput) -> Result<Self> {
        if input.origin.trim().is_empty() {
            return Err(JunctionError::InvalidSignal("origin must not be empty".into()));
        }
        if input.payload.is_empty() && input.media_ref.is_none() {
            return Err(JunctionError::InvalidSignal(
                "payload and media ref are both empty".into(),
            ));
        }
        let id = input.resolve_id()?;
        Ok(Self {
            id,
            created_at: Utc::now(),
            origin: input.origin,
            media_ref: input.media_ref,
            payload_digest: ContentDigest::from_bytes(&input.payload),
            payload_len: input.payload.len(),
            payload: input.payload,
        })
    }

    /// Lossy UTF-8 view of the payload, for lexical analysis and prompts.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Ids become file names, so only a conservative alphabet is accepted.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(JunctionError::InvalidSignal(format!(
            "id length must be 1..={MAX_ID_LEN}"
        )));
    }
    if id.starts_with('.')
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(JunctionError::InvalidSignal(format!("illegal id: {id}")));
    }
    Ok(())
}
