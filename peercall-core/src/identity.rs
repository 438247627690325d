//! Peer identity
//!
//! Every remote party is addressed by a stable string identifier. The engine
//! keys its session map by it, so it must be cheap to clone, hash and compare.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Stable identifier of a signaling peer
///
/// Immutable once created. Empty identifiers are rejected by [`PeerId::parse`]
/// and by engine configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse a peer identity, rejecting blank input
    ///
    /// # Errors
    ///
    /// Returns error if the trimmed input is empty
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer identity cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
