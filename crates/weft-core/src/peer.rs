//! Peer identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a mesh node.
///
/// Ids are plain strings compared lexicographically. The rendezvous
/// tie-break relies on this ordering agreeing with generation order,
/// which holds because generated ids begin with a fixed-width
/// millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh id: millisecond timestamp plus a 5-digit random suffix.
    pub fn generate() -> Self {
        use rand::Rng;
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
        PeerId(format!("{millis}{suffix:05}"))
    }

    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}
