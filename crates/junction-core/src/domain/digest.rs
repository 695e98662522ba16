use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// SHA-256 hex digest used for content identity (signal ids, cache keys,
/// artifact fingerprints in the validation log).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest of a single byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Digest of several parts, each length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and file names.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_hex() {
        let a = ContentDigest::from_bytes(b"hello");
        let b = ContentDigest::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn parts_are_length_prefixed() {
        let a = ContentDigest::from_parts(&[b"ab", b"c"]);
        let b = ContentDigest::from_parts(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn short_is_prefix() {
        let d = ContentDigest::from_bytes(b"x");
        assert_eq!(d.short().len(), 12);
        assert!(d.as_str().starts_with(d.short()));
    }
}
