//! Simulator and entity identifiers.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::str::FromStr;

/// Unique identifier of a started simulator (e.g. `"Probe-0"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimId(String);

impl SimId {
    /// Creates a simulator id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SimId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SimId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for SimId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Globally unique entity id: `sid.eid`.
///
/// The simulator id never contains a dot; everything after the first dot
/// is the simulator-scoped entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FullId {
    pub sid: SimId,
    pub eid: String,
}

impl FullId {
    /// Creates a full id from its parts.
    pub fn new(sid: impl Into<SimId>, eid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            eid: eid.into(),
        }
    }
}

impl std::fmt::Display for FullId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.sid, self.eid)
    }
}

impl FromStr for FullId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((sid, eid)) if !sid.is_empty() && !eid.is_empty() => Ok(Self::new(sid, eid)),
            _ => Err(ConfigurationError::InvalidFullId(s.to_string())),
        }
    }
}

impl TryFrom<String> for FullId {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FullId> for String {
    fn from(id: FullId) -> Self {
        id.to_string()
    }
}
