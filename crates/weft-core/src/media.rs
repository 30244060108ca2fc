//! Media records — per-file metadata shared on the mesh and persisted
//! alongside the chunks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Metadata for one tracked file.
///
/// `available` is the set of part indices the *record's owner* holds;
/// `remote` is its (possibly stale) view of what every other peer holds.
/// This same record is the payload of `info` envelopes and the value
/// stored under the `-info` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub parts: u32,
    pub size: u64,
    #[serde(default)]
    pub available: BTreeSet<u32>,
    #[serde(default)]
    pub remote: BTreeMap<PeerId, BTreeSet<u32>>,
}

impl MediaInfo {
    /// A record for a freshly split local file: all parts held, no remote view.
    pub fn local(url: impl Into<String>, parts: u32, size: u64) -> Self {
        MediaInfo {
            url: url.into(),
            parts,
            size,
            available: (0..parts).collect(),
            remote: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.available.len() as u32 == self.parts
    }

    /// Merge a report received from `from`. The report's `available` set
    /// is what `from` itself holds; its `remote` map is second-hand
    /// knowledge about other peers. Union only — a part once known to be
    /// held is never forgotten.
    pub fn merge_from(&mut self, from: &PeerId, report: &MediaInfo) {
        self.remote
            .entry(from.clone())
            .or_default()
            .extend(report.available.iter().copied());
        for (peer, parts) in &report.remote {
            self.remote
                .entry(peer.clone())
                .or_default()
                .extend(parts.iter().copied());
        }
    }
}

/// Storage key for a file's metadata record.
pub fn info_key(url: &str) -> String {
    format!("{url}-info")
}

/// Storage key for part `number` of a file.
pub fn part_key(url: &str, number: u32) -> String {
    format!("{url}-part{number}")
}

/// How many fixed-size parts a buffer of `len` bytes splits into.
pub fn part_count(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size) as u32
}
