//! Shared primitives for the Helmsman workspace.
//!
//! Identifier newtypes used across the session, perceiver, dispatcher and
//! loop crates. Serde support is feature-gated so leaf crates that never
//! serialize ids stay dependency-light.

use std::fmt;

use uuid::Uuid;

/// Identity of one orchestration run (one task, one browser session).
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Browser target (tab) identifier as reported by the DevTools endpoint.
///
/// Never minted locally; always echoes a `targetId` the browser handed us.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TargetId(pub String);

impl From<String> for TargetId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for TargetId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend node identifier: the key correlating the same element across the
/// structural snapshot, the accessibility tree and layout geometry within one
/// extraction pass.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BackendNodeId(pub u64);

impl From<u64> for BackendNodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<BackendNodeId> for u64 {
    fn from(id: BackendNodeId) -> Self {
        id.0
    }
}

impl fmt::Display for BackendNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
