//! Weft wire envelope — the message unit routed through the mesh.
//!
//! Envelopes travel as JSON text frames over the data channel and the
//! rendezvous channel alike. The field names here ARE the wire format;
//! a node that renames `forwardBy` stops interoperating.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::peer::PeerId;

/// Wire value of the broadcast recipient.
pub const BROADCAST_SENTINEL: i64 = -1;

// ── Envelope kind ─────────────────────────────────────────────────────────────

/// Every message type the mesh dispatches on.
///
/// The first eight cross the wire. `Connected`/`Disconnected` are emitted
/// locally when a channel opens or closes and share the same dispatch
/// table. A kind outside this set fails decoding — there is no
/// string-keyed fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    RequestPeer,
    Offer,
    Answer,
    #[serde(rename = "icecandidate")]
    IceCandidate,
    RequestInfo,
    Info,
    RequestPart,
    Part,
    Connected,
    Disconnected,
}

// ── Recipient ─────────────────────────────────────────────────────────────────

/// The `to` field: a specific peer, or the broadcast sentinel `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Broadcast,
    Peer(PeerId),
}

impl Recipient {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    /// The addressed peer, if any.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Recipient::Peer(id) => Some(id),
            Recipient::Broadcast => None,
        }
    }
}

impl From<PeerId> for Recipient {
    fn from(id: PeerId) -> Self {
        Recipient::Peer(id)
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Recipient::Broadcast => serializer.serialize_i64(BROADCAST_SENTINEL),
            Recipient::Peer(id) => serializer.serialize_str(id.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecipientVisitor;

        impl<'de> Visitor<'de> for RecipientVisitor {
            type Value = Recipient;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a peer id string or the broadcast sentinel -1")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Recipient, E> {
                if v == BROADCAST_SENTINEL {
                    Ok(Recipient::Broadcast)
                } else {
                    Err(E::custom(format!("invalid recipient number: {v}")))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Recipient, E> {
                Err(E::custom(format!("invalid recipient number: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Recipient, E> {
                Ok(Recipient::Peer(PeerId::new(v)))
            }
        }

        deserializer.deserialize_any(RecipientVisitor)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A routed mesh message.
///
/// `ttl` is the remaining hop budget; `forward_by` lists every node that
/// has already relayed this envelope instance, in relay order. Both are
/// updated in place while relaying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: PeerId,
    pub to: Recipient,
    pub ttl: u32,
    #[serde(rename = "forwardBy")]
    pub forward_by: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
}

impl Envelope {
    /// A fresh peer-discovery broadcast.
    pub fn request_peer(from: PeerId, ttl: u32) -> Self {
        Envelope {
            kind: EnvelopeKind::RequestPeer,
            from,
            to: Recipient::Broadcast,
            ttl,
            forward_by: Vec::new(),
            url: None,
            data: None,
            number: None,
        }
    }

    /// A local lifecycle event (`connected`/`disconnected`) for the bus.
    pub fn local_event(kind: EnvelopeKind, remote: PeerId) -> Self {
        Envelope {
            kind,
            from: remote,
            to: Recipient::Broadcast,
            ttl: 0,
            forward_by: Vec::new(),
            url: None,
            data: None,
            number: None,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }

    /// Parse a JSON text frame. A missing required field or an unknown
    /// `type` tag fails here; the frame never reaches dispatch.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::Decode)
    }

    /// Check the fields the typed struct cannot enforce on its own.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.from.as_str().is_empty() {
            return Err(WireError::MalformedEnvelope("from"));
        }
        if let Recipient::Peer(id) = &self.to {
            if id.as_str().is_empty() {
                return Err(WireError::MalformedEnvelope("to"));
            }
        }
        Ok(())
    }

    /// Is this envelope addressed to `id` (directly or by broadcast)?
    pub fn addressed_to(&self, id: &PeerId) -> bool {
        match &self.to {
            Recipient::Broadcast => true,
            Recipient::Peer(peer) => peer == id,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("envelope field `{0}` is missing or empty")]
    MalformedEnvelope(&'static str),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
