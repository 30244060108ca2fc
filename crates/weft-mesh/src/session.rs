//! Session negotiation seam — the opaque capability that turns an
//! offer/answer/candidate exchange into a usable data channel.
//!
//! The mesh never looks inside descriptions or candidates; they are
//! opaque JSON payloads produced by one side's session and consumed by
//! the other's. Real deployments back this with a WebRTC stack;
//! `testing::MemoryHub` backs it with a deterministic in-memory pairing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::DataChannel;
use weft_core::PeerId;

/// Out-of-band events a session produces while negotiating.
pub enum SessionEvent {
    /// A locally-gathered candidate that must reach the remote peer.
    IceCandidate(Value),
    /// The remote peer opened the data channel (answerer side only).
    RemoteChannel(Arc<dyn DataChannel>),
}

/// One negotiation session with a single remote peer.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create the local offer and attach it as the local description.
    async fn create_offer(&self) -> anyhow::Result<Value>;

    /// Apply the remote offer, create the answer, attach it as the local
    /// description.
    async fn create_answer(&self, remote: Value) -> anyhow::Result<Value>;

    /// Apply the remote description (the answer, on the offerer side).
    async fn set_remote_description(&self, description: Value) -> anyhow::Result<()>;

    /// Apply one remote candidate.
    async fn add_ice_candidate(&self, candidate: Value) -> anyhow::Result<()>;

    /// Create the data channel. Called only on the offerer side; the
    /// answerer's channel arrives via [`SessionEvent::RemoteChannel`].
    fn create_channel(&self) -> Arc<dyn DataChannel>;

    /// Next session event, or `None` once the session produces no more.
    async fn next_event(&self) -> Option<SessionEvent>;
}

/// Produces sessions on demand, one per (local, remote) pair.
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, local: &PeerId, remote: &PeerId) -> Arc<dyn PeerSession>;
}
